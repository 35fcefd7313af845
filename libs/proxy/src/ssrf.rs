//! Guard against proxying into internal networks.
//!
//! External route targets are operator-supplied hostnames; before the proxy
//! ever connects to one, the resolved address must fall outside every
//! reserved range below. DNS failure blocks the target outright so a
//! rebinding resolver cannot slip through the check.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;

use ipnet::IpNet;
use tracing::warn;

/// Ranges the proxy refuses to forward to: loopback, RFC 1918, link-local
/// (cloud metadata endpoints live here), the zero network, and their IPv6
/// counterparts.
static BLOCKED_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "0.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static CIDR list parses"))
    .collect()
});

#[derive(Debug, thiserror::Error)]
pub enum SsrfError {
    #[error("Target {0} is in a blocked network range")]
    BlockedRange(String),

    #[error("DNS resolution failed for {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Host {0} did not resolve to any usable address")]
    NoAddress(String),
}

pub fn ip_is_blocked(ip: IpAddr) -> bool {
    BLOCKED_NETS.iter().any(|net| net.contains(&ip))
}

/// Whether `host` (an IP literal or a hostname) lands in a blocked range.
///
/// Hostnames are resolved; resolution failure counts as blocked
/// (fail-closed), so an unresolvable or rebinding name can never pass.
pub async fn is_blocked_target(host: &str) -> Result<(), SsrfError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if ip_is_blocked(ip) {
            return Err(SsrfError::BlockedRange(host.to_string()));
        }
        return Ok(());
    }

    let addrs = resolve(host).await?;
    if addrs.iter().any(|addr| ip_is_blocked(addr.ip())) {
        return Err(SsrfError::BlockedRange(host.to_string()));
    }
    Ok(())
}

/// Resolve `host` and return the first address outside every blocked
/// range, pinning the DNS answer so the subsequent connect cannot land on
/// a different (private) IP.
pub async fn resolve_and_validate_host(host: &str, port: u16) -> Result<SocketAddr, SsrfError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if ip_is_blocked(ip) {
            return Err(SsrfError::BlockedRange(host.to_string()));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs = resolve(host).await?;
    addrs
        .into_iter()
        .find(|addr| !ip_is_blocked(addr.ip()))
        .map(|addr| SocketAddr::new(addr.ip(), port))
        .ok_or_else(|| SsrfError::BlockedRange(host.to_string()))
}

async fn resolve(host: &str) -> Result<Vec<SocketAddr>, SsrfError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| {
            warn!(host, error = %source, "DNS resolution failed, blocking target");
            SsrfError::Resolution {
                host: host.to_string(),
                source,
            }
        })?
        .collect();

    if addrs.is_empty() {
        return Err(SsrfError::NoAddress(host.to_string()));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_ipv4_ranges() {
        for ip in [
            "127.0.0.1",
            "127.255.255.254",
            "10.0.0.1",
            "10.255.0.1",
            "172.16.0.1",
            "172.31.255.1",
            "192.168.1.10",
            "169.254.169.254",
            "0.0.0.0",
        ] {
            assert!(ip_is_blocked(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_blocked_ipv6_ranges() {
        for ip in ["::1", "fc00::1", "fd12:3456::1", "fe80::1"] {
            assert!(ip_is_blocked(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        for ip in ["93.184.216.34", "8.8.8.8", "172.32.0.1", "2606:4700::1111"] {
            assert!(!ip_is_blocked(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_ip_literal_blocked_without_dns() {
        assert!(matches!(
            is_blocked_target("169.254.169.254").await,
            Err(SsrfError::BlockedRange(_))
        ));
        assert!(matches!(
            is_blocked_target("[::1]").await,
            Err(SsrfError::BlockedRange(_))
        ));
        assert!(is_blocked_target("93.184.216.34").await.is_ok());
    }

    #[tokio::test]
    async fn test_localhost_name_blocked() {
        // Resolves via the hosts file to loopback
        assert!(is_blocked_target("localhost").await.is_err());
    }

    #[tokio::test]
    async fn test_dns_failure_fails_closed() {
        // RFC 2606 reserves .invalid; resolution can never succeed
        let result = is_blocked_target("gordon-test.invalid").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_and_validate_pins_ip_literal() {
        let addr = resolve_and_validate_host("93.184.216.34", 443).await.unwrap();
        assert_eq!(addr.to_string(), "93.184.216.34:443");

        assert!(resolve_and_validate_host("10.0.0.1", 80).await.is_err());
    }
}
