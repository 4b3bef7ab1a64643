//! Address the server advertises to eyes in REGISTER_EYE_ACK.
//!
//! Resolution order:
//!   1. Config override -- `server.advertise_ip` in TOML.
//!   2. Bind address, when it is a concrete (non-wildcard) IP.
//!   3. Route lookup -- the local address the OS picks for an outbound UDP
//!      "connection" to a public address. Nothing is sent.
//!   4. Loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Destination for the route lookup. Any routable address works.
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 65530);

/// Resolve the IP handed to eyes.
pub fn advertise_ip(config_override: Option<IpAddr>, bind_ip: IpAddr) -> IpAddr {
    if let Some(ip) = config_override {
        return ip;
    }
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }
    match route_local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("local address lookup failed, advertising loopback: {e}");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Local IP of the interface that routes toward the public internet.
pub fn route_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_TARGET)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no local address for outbound route",
        ));
    }
    Ok(ip)
}
