//! Multi-homed interface selection.
//!
//! Candidates are the local non-loopback, non-link-local addresses. Each
//! is scored by whether a TCP handshake to a configured coordinator
//! succeeds from it and whether it shares a /24 with a coordinator;
//! reachable beats unreachable, same-subnet beats different-subnet. Ties
//! break on the lowest address so the choice is stable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::net::{lookup_host, TcpSocket};
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub ip: IpAddr,
    pub reachable: bool,
    pub same_subnet: bool,
}

impl ScoredCandidate {
    fn score(&self) -> u8 {
        (self.reachable as u8) * 2 + self.same_subnet as u8
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Local addresses eligible to be advertised.
pub fn candidate_addresses() -> Vec<IpAddr> {
    let mut candidates: Vec<IpAddr> = if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .map(|iface| iface.ip())
        .filter(|ip| !ip.is_loopback() && !is_link_local(ip))
        .collect();
    candidates.sort();
    candidates.dedup();
    candidates
}

pub fn same_subnet_24(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}

async fn resolve_coordinators(coordinators: &[String]) -> Vec<SocketAddr> {
    let mut resolved = Vec::new();
    for entry in coordinators {
        match lookup_host(entry.as_str()).await {
            Ok(addrs) => resolved.extend(addrs),
            Err(e) => debug!("Cannot resolve coordinator {entry}: {e}"),
        }
    }
    resolved
}

async fn can_connect_from(candidate: IpAddr, target: SocketAddr) -> bool {
    let socket = match (candidate, target) {
        (IpAddr::V4(_), SocketAddr::V4(_)) => TcpSocket::new_v4(),
        (IpAddr::V6(_), SocketAddr::V6(_)) => TcpSocket::new_v6(),
        _ => return false,
    };
    let Ok(socket) = socket else {
        return false;
    };
    if socket.bind(SocketAddr::new(candidate, 0)).is_err() {
        return false;
    }
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(target)).await,
        Ok(Ok(_))
    )
}

/// Score a fixed candidate list against the coordinator addresses.
pub async fn score_candidates(
    candidates: &[IpAddr],
    coordinators: &[SocketAddr],
) -> Vec<ScoredCandidate> {
    let mut scored = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut reachable = false;
        let mut same_subnet = false;
        for coordinator in coordinators {
            if same_subnet_24(candidate, &coordinator.ip()) {
                same_subnet = true;
            }
            if !reachable && can_connect_from(*candidate, *coordinator).await {
                reachable = true;
            }
        }
        scored.push(ScoredCandidate {
            ip: *candidate,
            reachable,
            same_subnet,
        });
    }
    scored
}

/// Best-effort default route address, used when no coordinator is
/// reachable or configured (single-node clusters, the coordinator
/// itself).
pub fn default_route_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    // No packet is sent; this only selects a route.
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Choose the address to advertise in the self NodeInfo.
///
/// An explicit (non-wildcard) bind address wins outright. Otherwise the
/// highest-scoring candidate interface is selected.
pub async fn select_address(bind_address: IpAddr, coordinators: &[String]) -> Result<IpAddr> {
    if !bind_address.is_unspecified() {
        return Ok(bind_address);
    }

    let candidates = candidate_addresses();
    if candidates.is_empty() {
        return Ok(default_route_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    let resolved = resolve_coordinators(coordinators).await;
    if resolved.is_empty() {
        let chosen = default_route_ip()
            .filter(|ip| candidates.contains(ip))
            .unwrap_or(candidates[0]);
        info!("Selected address {chosen} (no coordinators to probe)");
        return Ok(chosen);
    }

    let mut scored = score_candidates(&candidates, &resolved).await;
    // Highest score first, lowest address on ties.
    scored.sort_by(|a, b| b.score().cmp(&a.score()).then(a.ip.cmp(&b.ip)));
    let best = scored.first().expect("candidates is non-empty");
    info!(
        "Selected address {} (reachable={}, same_subnet={})",
        best.ip, best.reachable, best.same_subnet
    );
    Ok(best.ip)
}
