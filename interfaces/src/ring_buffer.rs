//! Byte Ring Buffer
//!
//! Fixed-capacity FIFO used by every transport to decouple the I/O thread of
//! the medium from the thread consuming samples. One mutex guards the state;
//! readers wait on `not_empty`, writers on `not_full`. Reads and writes are
//! all-or-nothing: either the requested byte count is transferred or an error
//! is returned.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Ring buffer errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Timed out waiting for ring buffer")]
    Timeout,

    #[error("Ring buffer stopped")]
    Stopped,

    #[error("Request of {requested} bytes exceeds ring buffer capacity of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },
}

struct RingState {
    buffer: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
    count: usize,
    stopped: bool,
}

impl RingState {
    fn space(&self) -> usize {
        self.buffer.len() - self.count
    }

    fn push(&mut self, data: &[u8]) {
        let capacity = self.buffer.len();
        let first = (capacity - self.write_idx).min(data.len());
        self.buffer[self.write_idx..self.write_idx + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buffer[..rest].copy_from_slice(&data[first..]);
        self.write_idx = (self.write_idx + data.len()) % capacity;
        self.count += data.len();
    }

    fn pop(&mut self, dst: &mut [u8]) {
        let capacity = self.buffer.len();
        let first = (capacity - self.read_idx).min(dst.len());
        dst[..first].copy_from_slice(&self.buffer[self.read_idx..self.read_idx + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.buffer[..rest]);
        self.read_idx = (self.read_idx + dst.len()) % capacity;
        self.count -= dst.len();
    }

    fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.count = 0;
    }
}

/// Blocking byte FIFO with timed variants
pub struct RingBuffer {
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring buffer holding up to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("Allocating ring buffer of {} bytes", capacity);

        Self {
            state: Mutex::new(RingState {
                buffer: vec![0u8; capacity],
                read_idx: 0,
                write_idx: 0,
                count: 0,
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes currently buffered
    pub fn status(&self) -> usize {
        self.state.lock().count
    }

    /// Number of bytes that can be written without blocking
    pub fn space(&self) -> usize {
        self.state.lock().space()
    }

    /// Write as much of `data` as fits without blocking.
    ///
    /// A return value smaller than `data.len()` signals an overflow; the
    /// bytes that did not fit are dropped.
    pub fn try_write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        if state.stopped {
            return 0;
        }

        let n = data.len().min(state.space());
        if n < data.len() {
            debug!("Ring buffer overrun: lost {} of {} bytes", data.len() - n, data.len());
        }
        state.push(&data[..n]);
        drop(state);

        if n > 0 {
            self.not_empty.notify_all();
        }
        n
    }

    /// Write all of `data`, blocking until enough space is free
    pub fn write(&self, data: &[u8]) -> Result<usize, RingBufferError> {
        self.write_until(data, None)
    }

    /// Write all of `data`, giving up after `timeout`
    pub fn write_timed(&self, data: &[u8], timeout: Duration) -> Result<usize, RingBufferError> {
        self.write_until(data, Some(Instant::now() + timeout))
    }

    /// Read exactly `dst.len()` bytes, blocking until they are available
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, RingBufferError> {
        self.read_until(dst, None)
    }

    /// Read exactly `dst.len()` bytes, giving up after `timeout`
    pub fn read_timed(&self, dst: &mut [u8], timeout: Duration) -> Result<usize, RingBufferError> {
        self.read_until(dst, Some(Instant::now() + timeout))
    }

    /// Wait up to `timeout` for data, then read everything buffered that fits
    /// in `dst`. Used by pump threads that forward whatever is pending.
    pub fn read_some_timed(&self, dst: &mut [u8], timeout: Duration) -> Result<usize, RingBufferError> {
        if dst.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.wait_for(Some(deadline), &self.not_empty, |s| s.count > 0)?;
        let n = state.count.min(dst.len());
        state.pop(&mut dst[..n]);
        drop(state);

        self.not_full.notify_all();
        Ok(n)
    }

    /// Discard all buffered content
    pub fn reset(&self) {
        let mut state = self.state.lock();
        trace!("Ring buffer reset, discarding {} bytes", state.count);
        state.clear();
        drop(state);
        self.not_full.notify_all();
    }

    /// Wake every waiter and refuse further transfers
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Accept transfers again after `stop()`, starting from an empty buffer
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.clear();
        state.stopped = false;
    }

    /// True once `stop()` has been called
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn write_until(&self, data: &[u8], deadline: Option<Instant>) -> Result<usize, RingBufferError> {
        if data.len() > self.capacity {
            return Err(RingBufferError::TooLarge {
                requested: data.len(),
                capacity: self.capacity,
            });
        }

        let mut state = self.wait_for(deadline, &self.not_full, |s| s.space() >= data.len())?;
        state.push(data);
        drop(state);

        self.not_empty.notify_all();
        Ok(data.len())
    }

    fn read_until(&self, dst: &mut [u8], deadline: Option<Instant>) -> Result<usize, RingBufferError> {
        if dst.len() > self.capacity {
            return Err(RingBufferError::TooLarge {
                requested: dst.len(),
                capacity: self.capacity,
            });
        }

        let needed = dst.len();
        let mut state = self.wait_for(deadline, &self.not_empty, |s| s.count >= needed)?;
        state.pop(dst);
        drop(state);

        self.not_full.notify_all();
        Ok(dst.len())
    }

    /// Lock the state and wait on `cond` until `ready` holds, the deadline
    /// passes or the buffer is stopped
    fn wait_for<F>(
        &self,
        deadline: Option<Instant>,
        cond: &Condvar,
        ready: F,
    ) -> Result<MutexGuard<'_, RingState>, RingBufferError>
    where
        F: Fn(&RingState) -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(RingBufferError::Stopped);
            }
            if ready(&state) {
                return Ok(state);
            }
            match deadline {
                Some(deadline) => {
                    if cond.wait_until(&mut state, deadline).timed_out() && !ready(&state) {
                        return Err(if state.stopped {
                            RingBufferError::Stopped
                        } else {
                            RingBufferError::Timeout
                        });
                    }
                }
                None => cond.wait(&mut state),
            }
        }
    }
}
