//! Port occupancy check.
//!
//! The listening port is the only cross-instance synchronisation primitive, and it is advisory:
//! a check result can be stale by the time the caller acts on it.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// Check whether `port` is bound on this host by binding `0.0.0.0:<port>` and releasing it.
///
/// Only `AddrInUse` counts as occupied. Any other bind failure (permission denied on a
/// privileged port, for instance) reports the port as free.
pub fn is_port_bound(port: u16) -> bool {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            log::trace!("Port {port} is free");
            false
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            log::trace!("Port {port} is bound");
            true
        }
        Err(e) => {
            log::debug!("Port {port} bind check failed ({e}); treating as unbound");
            false
        }
    }
}

/// `http://127.0.0.1:<port>`, the indirection target for a proxy listening on `port`.
#[must_use]
pub fn proxy_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
