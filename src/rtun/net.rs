use std::{
    borrow::Cow,
    net::{IpAddr, SocketAddr},
};

use anyhow::Context;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". Tokio bind APIs do not
/// accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolves `host:port` to one socket address, preferring the requested family.
pub async fn resolve_one(addr: &str, prefer_v4: bool) -> anyhow::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("resolve {addr}"))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4() == prefer_v4)
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("resolve {addr}: no addresses"))
}

/// Decides whether an accepted connection comes from the agent.
///
/// The agent is recognized purely by its source address. A bare IP matches any
/// source port; `host:port` matches one exact socket address. Anyone able to
/// originate traffic from that address is treated as the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMatcher {
    Ip(IpAddr),
    Exact(Vec<SocketAddr>),
}

impl AgentMatcher {
    pub async fn resolve(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            anyhow::bail!("agent address is empty");
        }

        let bare = spec
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(spec);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(AgentMatcher::Ip(ip.to_canonical()));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(spec)
            .await
            .with_context(|| format!("resolve agent address {spec}"))?
            .map(canonical)
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("resolve agent address {spec}: no addresses");
        }
        Ok(AgentMatcher::Exact(addrs))
    }

    pub fn matches(&self, peer: SocketAddr) -> bool {
        let peer = canonical(peer);
        match self {
            AgentMatcher::Ip(ip) => peer.ip() == *ip,
            AgentMatcher::Exact(addrs) => addrs.contains(&peer),
        }
    }
}

impl std::fmt::Display for AgentMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMatcher::Ip(ip) => write!(f, "{ip}"),
            AgentMatcher::Exact(addrs) => {
                let list: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

/// IPv4-mapped IPv6 peers (dual-stack listeners) compare as plain IPv4.
fn canonical(a: SocketAddr) -> SocketAddr {
    SocketAddr::new(a.ip().to_canonical(), a.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:7000").as_ref(), "[::]:7000");
    }

    #[tokio::test]
    async fn bare_ip_matches_any_port() {
        let m = AgentMatcher::resolve("10.0.0.7").await.unwrap();
        assert!(m.matches("10.0.0.7:1".parse().unwrap()));
        assert!(m.matches("10.0.0.7:55123".parse().unwrap()));
        assert!(!m.matches("10.0.0.8:55123".parse().unwrap()));
    }

    #[tokio::test]
    async fn socket_addr_matches_exact_port_only() {
        let m = AgentMatcher::resolve("127.0.0.1:4000").await.unwrap();
        assert!(m.matches("127.0.0.1:4000".parse().unwrap()));
        assert!(!m.matches("127.0.0.1:4001".parse().unwrap()));
    }

    #[tokio::test]
    async fn mapped_ipv6_peer_matches_ipv4_agent() {
        let m = AgentMatcher::resolve("192.168.1.5").await.unwrap();
        assert!(m.matches("[::ffff:192.168.1.5]:9000".parse().unwrap()));

        let m = AgentMatcher::resolve("[::1]").await.unwrap();
        assert!(m.matches("[::1]:9000".parse().unwrap()));
    }

    #[tokio::test]
    async fn empty_agent_address_is_rejected() {
        assert!(AgentMatcher::resolve("  ").await.is_err());
    }
}
