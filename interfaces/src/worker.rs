//! Pump Thread Lifecycle
//!
//! A port thread is stopped by closing its stop channel and then joined; the
//! thread polls its [`StopToken`] between blocking operations.

use crate::InterfaceError;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Handed to the thread body; reports when the owner asked it to exit
pub struct StopToken {
    rx: Receiver<()>,
}

impl StopToken {
    /// True once the owning [`Worker`] has signalled stop
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Named background thread with a channel-close stop signal
pub struct Worker {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a new named thread
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, InterfaceError>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(StopToken { rx: stop_rx }))
            .map_err(|e| {
                error!("Failed to spawn thread {}: {}", name, e);
                InterfaceError::InitializationFailed(format!("failed to spawn {}: {}", name, e))
            })?;

        debug!("Started thread {}", name);
        Ok(Self {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit without waiting for it
    pub fn signal(&mut self) {
        self.stop.take();
    }

    /// Signal the thread and wait for it to finish
    pub fn join(&mut self) {
        self.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Thread {} panicked", self.name);
            } else {
                debug!("Joined thread {}", self.name);
            }
        }
    }

    /// True when the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_join_stops_polling_thread() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();

        let mut worker = Worker::spawn("test-worker", move |stop| {
            while !stop.is_stopped() {
                counter.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        assert!(!worker.is_finished());
        worker.join();
        assert!(worker.is_finished());
        assert!(iterations.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_drop_joins() {
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        {
            let _worker = Worker::spawn("test-drop", move |stop| {
                while !stop.is_stopped() {
                    thread::sleep(Duration::from_millis(1));
                }
                flag.store(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
