//! Client address resolution and IP allow-listing

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Resolved client address, stored in request extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// An exact address or a CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpRule {
    Exact(IpAddr),
    Range { network: IpAddr, prefix: u8 },
}

impl IpRule {
    fn parse(entry: &str) -> Option<Self> {
        match entry.split_once('/') {
            Some((addr, prefix)) => {
                let network = normalize(addr.trim().parse().ok()?);
                let prefix: u8 = prefix.trim().parse().ok()?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                (prefix <= max).then_some(IpRule::Range { network, prefix })
            }
            None => entry.trim().parse().ok().map(|ip| IpRule::Exact(normalize(ip))),
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match *self {
            IpRule::Exact(allowed) => allowed == ip,
            IpRule::Range { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
                    u32::from(net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
                    u128::from(net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

/// Treat IPv4-mapped IPv6 addresses as plain IPv4
pub(crate) fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Addresses allowed to use the API; empty allows everyone
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    rules: Vec<IpRule>,
}

impl IpAllowList {
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let rule = IpRule::parse(entry).ok_or_else(|| {
                GatewayError::Config(format!("Invalid IP allow-list entry '{}'", entry))
            })?;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = normalize(ip);
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(ip))
    }
}

/// Pick the client address from the socket peer and `X-Forwarded-For`
///
/// With `trust_proxy` hops trusted, the address that many steps back along
/// the forwarding chain is used. Returns `None` if that entry is unparseable.
pub fn client_ip(peer: IpAddr, forwarded_for: Option<&str>, trust_proxy: usize) -> Option<IpAddr> {
    if trust_proxy == 0 {
        return Some(normalize(peer));
    }

    let forwarded: Vec<&str> = forwarded_for
        .map(|h| h.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let hops = forwarded.len();
    if hops == 0 {
        return Some(normalize(peer));
    }

    // Nearest hop is the rightmost entry; the leftmost is the origin
    forwarded[hops - trust_proxy.min(hops)]
        .parse()
        .ok()
        .map(normalize)
}

/// Client resolution settings plus the allow-list
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    pub allow_list: IpAllowList,
    pub trust_proxy: usize,
}

impl IpFilter {
    pub fn new(allow_list: IpAllowList, trust_proxy: usize) -> Self {
        Self {
            allow_list,
            trust_proxy,
        }
    }

    /// Client address for a request from `peer`
    pub fn resolve(&self, peer: Option<SocketAddr>, headers: &HeaderMap) -> Option<IpAddr> {
        let peer = peer?.ip();
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok());
        client_ip(peer, forwarded, self.trust_proxy)
    }
}

fn unauthorized_ip() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized IP" })),
    )
        .into_response()
}

/// Resolves the client address and enforces the allow-list
///
/// The resolved address is stored as [`ClientIp`] for later layers.
pub async fn ip_filter_middleware(
    State(filter): State<Arc<IpFilter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    match filter.resolve(peer, req.headers()) {
        Some(ip) if filter.allow_list.allows(ip) => {
            req.extensions_mut().insert(ClientIp(ip));
            next.run(req).await
        }
        Some(ip) => {
            warn!("Rejected request from {} not on the allow-list", ip);
            unauthorized_ip()
        }
        None if filter.allow_list.is_empty() => next.run(req).await,
        None => {
            warn!("Rejected request with unresolvable client address");
            unauthorized_ip()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_list_allows_all() {
        let list = IpAllowList::parse(Vec::<String>::new()).unwrap();
        assert!(list.allows(ip("203.0.113.9")));
    }

    #[test]
    fn test_exact_and_cidr() {
        let list = IpAllowList::parse(["127.0.0.1", "10.0.0.0/8", "2001:db8::/32"]).unwrap();

        assert!(list.allows(ip("127.0.0.1")));
        assert!(list.allows(ip("10.20.30.40")));
        assert!(list.allows(ip("2001:db8::1")));
        assert!(!list.allows(ip("11.0.0.1")));
        assert!(!list.allows(ip("2001:db9::1")));
    }

    #[test]
    fn test_ipv4_mapped_matches_ipv4_rule() {
        let list = IpAllowList::parse(["192.168.1.0/24"]).unwrap();
        assert!(list.allows(ip("::ffff:192.168.1.7")));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let list = IpAllowList::parse(["0.0.0.0/0"]).unwrap();
        assert!(list.allows(ip("8.8.8.8")));
        assert!(!list.allows(ip("::2")));
    }

    #[test]
    fn test_invalid_entry_rejected() {
        assert!(IpAllowList::parse(["not-an-ip"]).is_err());
        assert!(IpAllowList::parse(["10.0.0.0/33"]).is_err());
    }

    #[test]
    fn test_client_ip_resolution() {
        let peer = ip("10.0.0.2");

        assert_eq!(client_ip(peer, Some("1.2.3.4"), 0), Some(peer));
        assert_eq!(client_ip(peer, None, 1), Some(peer));
        assert_eq!(client_ip(peer, Some("1.2.3.4"), 1), Some(ip("1.2.3.4")));
        assert_eq!(
            client_ip(peer, Some("1.2.3.4, 5.6.7.8"), 1),
            Some(ip("5.6.7.8"))
        );
        assert_eq!(
            client_ip(peer, Some("1.2.3.4, 5.6.7.8"), 2),
            Some(ip("1.2.3.4"))
        );
        assert_eq!(client_ip(peer, Some("1.2.3.4"), 5), Some(ip("1.2.3.4")));
        assert_eq!(client_ip(peer, Some("garbage"), 1), None);
    }
}
