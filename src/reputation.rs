//! Client IP reputation: private-range classification and DNS list lookups
//! (RBL/RWL) through an injected resolver.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use hickory_resolver::TokioAsyncResolver;

pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Resolver capability used for the list queries. A name that resolves
/// means "listed"; NXDOMAIN or any resolution failure means "not listed".
pub trait Lookup: Send + Sync {
    fn query<'a>(&'a self, name: &'a str) -> LookupFuture<'a>;
}

/// Production resolver backed by the system DNS configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

impl Lookup for SystemResolver {
    fn query<'a>(&'a self, name: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            match self.inner.lookup_ip(name).await {
                Ok(response) => {
                    let addrs: Vec<String> =
                        response.iter().map(|ip| ip.to_string()).collect();
                    if addrs.is_empty() {
                        None
                    } else {
                        Some(addrs.join("+"))
                    }
                }
                Err(_) => None,
            }
        })
    }
}

/// A positive hit on a reputation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsListHit {
    pub list_type: &'static str,
    pub list_name: String,
    pub value: String,
}

/// True when the IP falls into a private/reserved range and reputation
/// checks should be skipped (RFC 1918, loopback, link-local, RFC 5737
/// test range). Peers that are not IPv4 are treated the same way.
pub fn is_private_ip(ip: &str) -> bool {
    let addr: Ipv4Addr = match ip.parse() {
        Ok(addr) => addr,
        Err(_) => return true,
    };
    let o = addr.octets();
    o[0] == 127
        || o[0] == 10
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 172 && (16..32).contains(&o[1]))
}

/// Builds the reversed-octet list query, `d.c.b.a.provider` for `a.b.c.d`.
pub fn build_query(ip: &str, provider: &str) -> Option<String> {
    let addr: Ipv4Addr = ip.parse().ok()?;
    let o = addr.octets();
    Some(format!("{}.{}.{}.{}.{}", o[3], o[2], o[1], o[0], provider))
}

/// Queries whitelist providers first, then blacklist providers. The first
/// whitelist hit short-circuits the blacklist checks.
pub struct ReputationChecker {
    lookup: Arc<dyn Lookup>,
    whitelists: Vec<String>,
    blacklists: Vec<String>,
}

impl ReputationChecker {
    pub fn new(lookup: Arc<dyn Lookup>, whitelists: Vec<String>, blacklists: Vec<String>) -> Self {
        Self {
            lookup,
            whitelists,
            blacklists,
        }
    }

    /// Classifies a client IP. Private IPs are never checked. A `white`
    /// hit means the IP is vouched for; a `black` hit means it is listed.
    pub async fn check(&self, ip: &str) -> Option<DnsListHit> {
        if is_private_ip(ip) {
            return None;
        }
        if let Some(hit) = self.first_listed(ip, &self.whitelists, "white").await {
            return Some(hit);
        }
        self.first_listed(ip, &self.blacklists, "black").await
    }

    async fn first_listed(
        &self,
        ip: &str,
        lists: &[String],
        list_type: &'static str,
    ) -> Option<DnsListHit> {
        for list in lists {
            let query = build_query(ip, list)?;
            if let Some(value) = self.lookup.query(&query).await {
                return Some(DnsListHit {
                    list_type,
                    list_name: list.clone(),
                    value,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeLookup {
        listed: HashMap<String, String>,
    }

    impl FakeLookup {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                listed: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        }
    }

    impl Lookup for FakeLookup {
        fn query<'a>(&'a self, name: &'a str) -> LookupFuture<'a> {
            let result = self.listed.get(name).cloned();
            Box::pin(async move { result })
        }
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("192.168.0.42"));
        assert!(is_private_ip("169.254.9.9"));
        assert!(is_private_ip("192.0.2.1"));
        assert!(is_private_ip("172.16.0.1"));
        assert!(is_private_ip("172.31.255.255"));
        assert!(!is_private_ip("172.15.0.1"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("192.0.3.1"));
        // unparseable peers skip the lookups
        assert!(is_private_ip("::1"));
        assert!(is_private_ip("not-an-ip"));
    }

    #[test]
    fn test_build_query() {
        assert_eq!(
            build_query("1.2.3.4", "bl.example.net").as_deref(),
            Some("4.3.2.1.bl.example.net")
        );
        assert_eq!(build_query("bogus", "bl.example.net"), None);
    }

    #[tokio::test]
    async fn test_blacklist_hit() {
        let lookup = FakeLookup::new(&[("4.3.2.1.bl.example.net", "127.0.0.2")]);
        let checker =
            ReputationChecker::new(lookup, vec![], vec!["bl.example.net".to_string()]);
        let hit = checker.check("1.2.3.4").await.unwrap();
        assert_eq!(hit.list_type, "black");
        assert_eq!(hit.list_name, "bl.example.net");
        assert_eq!(hit.value, "127.0.0.2");
    }

    #[tokio::test]
    async fn test_whitelist_short_circuits_blacklist() {
        let lookup = FakeLookup::new(&[
            ("4.3.2.1.wl.example.net", "127.0.0.10"),
            ("4.3.2.1.bl.example.net", "127.0.0.2"),
        ]);
        let checker = ReputationChecker::new(
            lookup,
            vec!["wl.example.net".to_string()],
            vec!["bl.example.net".to_string()],
        );
        let hit = checker.check("1.2.3.4").await.unwrap();
        assert_eq!(hit.list_type, "white");
        assert_eq!(hit.list_name, "wl.example.net");
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let lookup = FakeLookup::new(&[
            ("4.3.2.1.bl-two.example.net", "127.0.0.2"),
            ("4.3.2.1.bl-three.example.net", "127.0.0.3"),
        ]);
        let checker = ReputationChecker::new(
            lookup,
            vec![],
            vec![
                "bl-one.example.net".to_string(),
                "bl-two.example.net".to_string(),
                "bl-three.example.net".to_string(),
            ],
        );
        let hit = checker.check("1.2.3.4").await.unwrap();
        assert_eq!(hit.list_name, "bl-two.example.net");
    }

    #[tokio::test]
    async fn test_unlisted_and_private() {
        let lookup = FakeLookup::new(&[]);
        let checker = ReputationChecker::new(
            lookup,
            vec!["wl.example.net".to_string()],
            vec!["bl.example.net".to_string()],
        );
        assert_eq!(checker.check("1.2.3.4").await, None);
        assert_eq!(checker.check("127.0.0.1").await, None);
    }
}
