//! Logical Channel to Port Mapping
//!
//! Logical channels are visited in ascending order and each one takes the
//! first still-unassigned port, in declaration order, whose frequency matches.
//! A port configured with frequency 0 matches any channel.

/// Map each requested frequency (MHz) onto a port index.
///
/// `matches(port, freq_mhz)` reports whether `port` can serve `freq_mhz`.
/// Channels that find no free matching port map to `None`.
pub fn map_channels<F>(requested_mhz: &[u32], nof_ports: usize, matches: F) -> Vec<Option<usize>>
where
    F: Fn(usize, u32) -> bool,
{
    let mut taken = vec![false; nof_ports];

    requested_mhz
        .iter()
        .map(|&freq| {
            let port = (0..nof_ports).find(|&p| !taken[p] && matches(p, freq))?;
            taken[port] = true;
            Some(port)
        })
        .collect()
}

/// Invert a channel mapping: for each port, the logical channel routed to it
pub fn port_sources(mapping: &[Option<usize>], nof_ports: usize) -> Vec<Option<usize>> {
    let mut sources = vec![None; nof_ports];
    for (channel, port) in mapping.iter().enumerate() {
        if let Some(port) = *port {
            sources[port] = Some(channel);
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_freq(ports: &[u32]) -> impl Fn(usize, u32) -> bool + '_ {
        move |p, f| ports[p] == 0 || ports[p] == f
    }

    #[test]
    fn test_permuted_frequencies_route_exactly() {
        let ports = [2680, 2400, 3500];
        let perms: [[u32; 3]; 6] = [
            [2680, 2400, 3500],
            [2680, 3500, 2400],
            [2400, 2680, 3500],
            [2400, 3500, 2680],
            [3500, 2680, 2400],
            [3500, 2400, 2680],
        ];

        for requested in perms {
            let mapping = map_channels(&requested, ports.len(), by_freq(&ports));
            for (ch, port) in mapping.iter().enumerate() {
                let port = port.unwrap();
                assert_eq!(ports[port], requested[ch]);
            }
        }
    }

    #[test]
    fn test_unconfigured_frequency_is_unmapped() {
        let ports = [2680, 2400];
        let mapping = map_channels(&[2400, 1800], ports.len(), by_freq(&ports));
        assert_eq!(mapping, vec![Some(1), None]);
    }

    #[test]
    fn test_wildcard_ports_taken_in_declaration_order() {
        let ports = [0, 0, 0];
        let mapping = map_channels(&[100, 200, 300], ports.len(), by_freq(&ports));
        assert_eq!(mapping, vec![Some(0), Some(1), Some(2)]);

        // The exact match is behind a wildcard, and the wildcard wins
        let ports = [0, 2680];
        let mapping = map_channels(&[2680, 2680], ports.len(), by_freq(&ports));
        assert_eq!(mapping, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_more_channels_than_ports() {
        let ports = [0];
        let mapping = map_channels(&[1, 2], ports.len(), by_freq(&ports));
        assert_eq!(mapping, vec![Some(0), None]);
    }

    #[test]
    fn test_port_sources() {
        let sources = port_sources(&[Some(2), None, Some(0)], 4);
        assert_eq!(sources, vec![Some(2), None, Some(0), None]);
    }
}
