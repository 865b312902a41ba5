use anyhow::{anyhow, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Public address used only to select the outbound route; no packet is sent.
const ROUTE_PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Determine this machine's LAN-facing IPv4 address.
///
/// Prefers the source address the kernel would pick for outbound traffic
/// (a connected UDP socket never transmits anything), falling back to the
/// first non-loopback interface address when no default route exists.
pub fn local_lan_address() -> Result<Ipv4Addr> {
    match outbound_route_address() {
        Ok(ip) => Ok(ip),
        Err(route_err) => {
            tracing::debug!(error = %route_err, "no outbound route, falling back to interface list");
            first_interface_address()
        }
    }
}

fn outbound_route_address() -> Result<Ipv4Addr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("bind probe socket")?;
    sock.connect(ROUTE_PROBE_TARGET).context("select outbound route")?;
    match sock.local_addr()?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Ok(v4),
        other => Err(anyhow!("outbound route has no usable IPv4 source: {other}")),
    }
}

fn first_interface_address() -> Result<Ipv4Addr> {
    let mut candidates: Vec<Ipv4Addr> = get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !v4.ip.is_loopback() && !v4.ip.is_link_local() => Some(v4.ip),
            _ => None,
        })
        .collect();
    // Private ranges first, then numeric order for stable output
    candidates.sort_by_key(|ip| (!ip.is_private(), u32::from(*ip)));
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no non-loopback IPv4 interface found"))
}

/// Convert an IPv4 address into its /24 network base.
///
/// For example `192.168.1.42` becomes `192.168.1.0/24`.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

/// Enumerate `base.start ..= base.end` within a /24 network.
///
/// Offsets are clamped to host octets `1..=254`, so the network and
/// broadcast addresses are never produced. An inverted range yields nothing.
pub fn host_range(network: Ipv4Net, start: u8, end: u8) -> Vec<Ipv4Addr> {
    let start = start.max(1);
    let end = end.min(254);
    if start > end {
        return Vec::new();
    }
    let o = network.network().octets();
    (start..=end)
        .map(|last| Ipv4Addr::new(o[0], o[1], o[2], last))
        .collect()
}

/// Same as [`host_range`] for an explicit list of last octets, keeping the
/// given order and skipping values outside `1..=254`.
pub fn hosts_from_octets(network: Ipv4Net, octets: &[u8]) -> Vec<Ipv4Addr> {
    let o = network.network().octets();
    octets
        .iter()
        .copied()
        .filter(|last| (1..=254).contains(last))
        .map(|last| Ipv4Addr::new(o[0], o[1], o[2], last))
        .collect()
}

/// True for addresses that can only reach this machine: `localhost`,
/// anything in `127.0.0.0/8`, `0.0.0.0` and `::1`.
pub fn is_local_only(address: &str) -> bool {
    let trimmed = address.trim();
    if trimmed.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}
