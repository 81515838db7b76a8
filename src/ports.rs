//! Unused TCP port discovery
//!
//! Ports are found by actually binding and releasing an OS socket rather than
//! keeping a free-list, since other processes on the host consume ports
//! outside our control.

use crate::error::HubError;
use std::net::TcpListener;

/// Probes attempted per requested port before giving up
const PROBES_PER_PORT: usize = 16;

/// Find `n` mutually distinct, currently-unbound local TCP ports.
///
/// Each candidate comes from binding `127.0.0.1:0` and reading back the
/// kernel-assigned port; the listener is dropped immediately so the caller
/// can re-bind it. Fails with [`HubError::ResourceExhausted`] if `n` distinct
/// ports cannot be found within a bounded number of probes; callers may
/// retry.
pub fn allocate_ports(n: usize) -> Result<Vec<u16>, HubError> {
    let max_probes = n.max(1) * PROBES_PER_PORT;
    let mut ports: Vec<u16> = Vec::with_capacity(n);
    let mut probes = 0;

    while ports.len() < n {
        if probes >= max_probes {
            return Err(HubError::ResourceExhausted { probes });
        }
        probes += 1;

        let port = match TcpListener::bind(("127.0.0.1", 0)) {
            Ok(listener) => match listener.local_addr() {
                Ok(addr) => addr.port(),
                Err(_) => continue,
            },
            Err(_) => continue,
        };

        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zero_ports() {
        assert!(allocate_ports(0).unwrap().is_empty());
    }

    #[test]
    fn test_allocate_single_port_is_bindable() {
        let ports = allocate_ports(1).unwrap();
        assert_eq!(ports.len(), 1);

        // The port was released, so we can bind it again
        let listener = TcpListener::bind(("127.0.0.1", ports[0]));
        assert!(listener.is_ok());
    }

    #[test]
    fn test_allocated_ports_are_distinct() {
        let ports = allocate_ports(5).unwrap();
        assert_eq!(ports.len(), 5);

        let mut deduped = ports.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), 5);
    }
}
