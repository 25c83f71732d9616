//! Listen port allocation for the swarm engine

use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use crate::error::{Result, StreamError};

/// First port at or above `start` that accepts a TCP bind
///
/// The probe listener is dropped immediately. Port 0 is never returned.
pub fn find_available_port(start: u16) -> Result<u16> {
    find_available_port_in(start.max(1)..=u16::MAX, |port| {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    })
}

fn find_available_port_in(
    range: RangeInclusive<u16>,
    mut bindable: impl FnMut(u16) -> bool,
) -> Result<u16> {
    let start = *range.start();
    for port in range {
        if bindable(port) {
            tracing::debug!(port, "found free listen port");
            return Ok(port);
        }
    }
    Err(StreamError::NoFreePort(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_first_bindable() {
        let port = find_available_port_in(100..=200, |p| p >= 150).unwrap();
        assert_eq!(port, 150);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let err = find_available_port_in(65530..=u16::MAX, |_| false).unwrap_err();
        assert!(matches!(err, StreamError::NoFreePort(65530)));
        assert!(err.is_config());
    }

    #[test]
    fn test_skips_occupied_port() {
        let held = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = held.local_addr().unwrap().port();

        let port = find_available_port(taken).unwrap();
        assert_ne!(port, taken);
        assert!(port > taken);
    }

    #[test]
    fn test_found_port_is_released() {
        let port = find_available_port(40000).unwrap();
        assert!(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok());
    }
}
