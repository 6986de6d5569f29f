//! Host identity helpers for the liveness publisher.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// This machine's hostname, falling back to `localhost` when the platform
/// cannot report one.
pub fn hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "localhost".to_string())
}

/// The primary non-loopback IPv4 address of this host, discovered by
/// routing a datagram socket (nothing is sent). Returns `None` on hosts
/// with no route out.
pub fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
        _ => None,
    }
}
