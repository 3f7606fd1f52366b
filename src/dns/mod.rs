//! DNS-driven lookups backing MX selection, SPF/DMARC/DKIM policy checks
//! and DNSBL queries. Grounded on the teacher's `handler/dns.rs`
//! (`hickory_resolver` usage, selector/domain TXT record convention);
//! extended with `reverse`, `blacklists`, and full SPF/DMARC parsing which
//! the teacher never needed.

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use dashmap::DashMap;
use hickory_resolver::{
    Resolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone)]
pub enum DnsError {
    #[error("dns resolution failed: {0}")]
    Resolve(String),
    #[error("no such domain")]
    NxDomain,
    #[error("lookup timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub priority: u16,
    pub hostname: String,
    pub ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    PermError,
    TempError,
}

#[derive(Debug, Clone)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub struct DmarcRecord {
    pub policy: String,
    pub subdomain_policy: Option<String>,
    pub rua: Option<String>,
    pub ruf: Option<String>,
    pub pct: u8,
}

#[derive(Hash, Eq, PartialEq, Clone)]
enum CacheKey {
    Mx(String),
    Txt(String),
    A(String),
    Ptr(String),
}

#[derive(Clone)]
enum CacheValue {
    Mx(Vec<MxHost>),
    Txt(Vec<String>),
    A(Vec<IpAddr>),
    Ptr(Option<String>),
}

/// Async resolver with a per-process cache, keyed `(record type, name)` as
/// specified. Negative results are cached too (the resolver never survives
/// a process restart, so there is no cross-restart staleness concern).
#[derive(Clone)]
pub struct DnsResolver {
    resolver: Resolver<TokioConnectionProvider>,
    cache: std::sync::Arc<DashMap<CacheKey, CacheValue>>,
}

const PER_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

impl DnsResolver {
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = PER_QUERY_TIMEOUT;
        opts.attempts = 2;

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .with_options(opts)
            .build(),
            cache: Default::default(),
        }
    }

    async fn with_overall_timeout<T>(
        fut: impl Future<Output = Result<T, DnsError>>,
    ) -> Result<T, DnsError> {
        tokio::time::timeout(OVERALL_TIMEOUT, fut)
            .await
            .unwrap_or(Err(DnsError::Timeout))
    }

    fn fqdn(name: &str) -> String {
        if name.ends_with('.') {
            name.to_owned()
        } else {
            format!("{name}.")
        }
    }

    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let key = CacheKey::Txt(name.to_owned());
        if let Some(CacheValue::Txt(v)) = self.cache.get(&key).map(|e| e.clone()) {
            return Ok(v);
        }

        let result = Self::with_overall_timeout(async {
            match self.resolver.txt_lookup(Self::fqdn(name)).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .flat_map(|chunk| chunk.iter().copied())
                            .map(|b| b as char)
                            .collect::<String>()
                    })
                    .collect::<Vec<_>>()),
                Err(e) if e.is_no_records_found() => Ok(Vec::new()),
                Err(e) => Err(DnsError::Resolve(e.to_string())),
            }
        })
        .await?;

        self.cache.insert(key, CacheValue::Txt(result.clone()));
        Ok(result)
    }

    async fn a_records(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let key = CacheKey::A(name.to_owned());
        if let Some(CacheValue::A(v)) = self.cache.get(&key).map(|e| e.clone()) {
            return Ok(v);
        }

        let result = Self::with_overall_timeout(async {
            match self.resolver.lookup_ip(Self::fqdn(name)).await {
                Ok(lookup) => Ok(lookup.iter().collect::<Vec<_>>()),
                Err(e) if e.is_no_records_found() => Ok(Vec::new()),
                Err(e) => Err(DnsError::Resolve(e.to_string())),
            }
        })
        .await?;

        self.cache.insert(key, CacheValue::A(result.clone()));
        Ok(result)
    }

    /// Ordered MX list, each host resolved to its A/AAAA addresses; hosts
    /// with no addresses are dropped. Falls back to `(10, domain, ips)`
    /// when the domain has no MX records at all.
    pub async fn mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        let key = CacheKey::Mx(domain.to_owned());
        if let Some(CacheValue::Mx(v)) = self.cache.get(&key).map(|e| e.clone()) {
            return Ok(v);
        }

        let records = Self::with_overall_timeout(async {
            match self.resolver.mx_lookup(Self::fqdn(domain)).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect::<Vec<_>>()),
                Err(e) if e.is_no_records_found() => Ok(Vec::new()),
                Err(e) => Err(DnsError::Resolve(e.to_string())),
            }
        })
        .await?;

        let mut hosts = Vec::new();
        if records.is_empty() {
            debug!(domain, "no MX records, falling back to A/AAAA of domain");
            let ips = self.a_records(domain).await?;
            if !ips.is_empty() {
                hosts.push(MxHost {
                    priority: 10,
                    hostname: domain.to_owned(),
                    ips,
                });
            }
        } else {
            let mut records = records;
            records.sort_by_key(|(pref, _)| *pref);
            for (pref, hostname) in records {
                let hostname = hostname.trim_end_matches('.').to_owned();
                let ips = self.a_records(&hostname).await?;
                if ips.is_empty() {
                    trace!(%hostname, "MX host has no addresses, dropping");
                    continue;
                }
                hosts.push(MxHost {
                    priority: pref,
                    hostname,
                    ips,
                });
            }
        }

        self.cache.insert(key, CacheValue::Mx(hosts.clone()));
        Ok(hosts)
    }

    /// Fetches the first TXT record on `name` that starts with `prefix`.
    async fn singular_txt(&self, name: &str, prefix: &str) -> Option<String> {
        self.txt_records(name)
            .await
            .ok()?
            .into_iter()
            .find(|r| r.starts_with(prefix))
    }

    /// Evaluates an SPF policy for `sender`'s domain against `ip`. One
    /// level of `include:` recursion is supported; deeper chains resolve
    /// to `neutral` rather than walking an unbounded include graph.
    pub async fn spf(&self, ip: IpAddr, sender: &str, helo: &str) -> SpfOutcome {
        let domain = sender.rsplit('@').next().unwrap_or(helo);
        self.spf_for_domain(ip, domain, 0).await
    }

    fn spf_for_domain<'a>(
        &'a self,
        ip: IpAddr,
        domain: &'a str,
        depth: u8,
    ) -> std::pin::Pin<Box<dyn Future<Output = SpfOutcome> + Send + 'a>> {
        Box::pin(async move {
            let Some(record) = self.singular_txt(domain, "v=spf1").await else {
                return SpfOutcome {
                    result: SpfResult::None,
                    explanation: format!("no SPF record for {domain}"),
                };
            };

            for term in record.split_whitespace().skip(1) {
                let (qualifier, mechanism) = match term.chars().next() {
                    Some(q @ ('+' | '-' | '~' | '?')) => (q, &term[1..]),
                    _ => ('+', term),
                };

                let matched = if let Some(cidr) = mechanism.strip_prefix("ip4:") {
                    ip_in_cidr(ip, cidr)
                } else if let Some(cidr) = mechanism.strip_prefix("ip6:") {
                    ip_in_cidr(ip, cidr)
                } else if mechanism == "a" || mechanism.starts_with("a:") || mechanism.starts_with("a/")
                {
                    let target = mechanism.strip_prefix("a:").unwrap_or(domain);
                    let target = target.split('/').next().unwrap_or(target);
                    self.a_records(target)
                        .await
                        .map(|ips| ips.contains(&ip))
                        .unwrap_or(false)
                } else if mechanism == "mx" || mechanism.starts_with("mx:") {
                    let target = mechanism.strip_prefix("mx:").unwrap_or(domain);
                    match self.mx(target).await {
                        Ok(hosts) => hosts.iter().any(|h| h.ips.contains(&ip)),
                        Err(_) => false,
                    }
                } else if let Some(included) = mechanism.strip_prefix("include:") {
                    if depth >= 1 {
                        false
                    } else {
                        matches!(
                            self.spf_for_domain(ip, included, depth + 1).await.result,
                            SpfResult::Pass
                        )
                    }
                } else if mechanism == "all" {
                    true
                } else {
                    false
                };

                if matched {
                    let result = match qualifier {
                        '+' => SpfResult::Pass,
                        '-' => SpfResult::Fail,
                        '~' => SpfResult::SoftFail,
                        '?' => SpfResult::Neutral,
                        _ => SpfResult::Neutral,
                    };
                    return SpfOutcome {
                        result,
                        explanation: format!("matched '{term}' in {record}"),
                    };
                }
            }

            SpfOutcome {
                result: SpfResult::Neutral,
                explanation: format!("no mechanism in '{record}' matched {ip}"),
            }
        })
    }

    /// DMARC lookup with fallback to the organizational domain (the last
    /// two labels) when the exact subdomain has no record.
    pub async fn dmarc(&self, domain: &str) -> Option<DmarcRecord> {
        let record = match self.singular_txt(&format!("_dmarc.{domain}"), "v=DMARC1").await {
            Some(r) => r,
            None => {
                let org_domain = organizational_domain(domain);
                if org_domain == domain {
                    return None;
                }
                self.singular_txt(&format!("_dmarc.{org_domain}"), "v=DMARC1")
                    .await?
            }
        };

        let tags: std::collections::HashMap<&str, &str> = record
            .split(';')
            .filter_map(|tag| tag.trim().split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        Some(DmarcRecord {
            policy: tags.get("p").copied().unwrap_or("none").to_owned(),
            subdomain_policy: tags.get("sp").map(|s| s.to_string()),
            rua: tags.get("rua").map(|s| s.to_string()),
            ruf: tags.get("ruf").map(|s| s.to_string()),
            pct: tags
                .get("pct")
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
        })
    }

    /// Extracts the `p=` value from `selector._domainkey.domain`'s TXT
    /// record, if present.
    pub async fn dkim_public_key(&self, selector: &str, domain: &str) -> Option<String> {
        let record = self
            .singular_txt(&format!("{selector}._domainkey.{domain}"), "v=DKIM1")
            .await?;

        record
            .split(';')
            .filter_map(|tag| tag.trim().split_once('='))
            .find(|(k, _)| k.trim() == "p")
            .map(|(_, v)| v.trim().to_owned())
    }

    /// Reverse (PTR) lookup. IPv4 only, as specified.
    pub async fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
        let key = CacheKey::Ptr(ip.to_string());
        if let Some(CacheValue::Ptr(v)) = self.cache.get(&key).map(|e| e.clone()) {
            return v;
        }

        let result = Self::with_overall_timeout(async {
            match self.resolver.reverse_lookup(IpAddr::V4(ip)).await {
                Ok(lookup) => Ok(lookup.iter().next().map(|name| {
                    name.to_utf8().trim_end_matches('.').to_owned()
                })),
                Err(e) if e.is_no_records_found() => Ok(None),
                Err(e) => Err(DnsError::Resolve(e.to_string())),
            }
        })
        .await
        .ok()
        .flatten();

        self.cache.insert(key, CacheValue::Ptr(result.clone()));
        result
    }

    /// Checks `ip` against each DNSBL zone in `servers`: an A record for
    /// the reversed-octet query name means listed, NXDOMAIN means not
    /// listed.
    pub async fn blacklists(
        &self,
        ip: Ipv4Addr,
        servers: &[String],
    ) -> std::collections::HashMap<String, bool> {
        let octets = ip.octets();
        let reversed = format!(
            "{}.{}.{}.{}",
            octets[3], octets[2], octets[1], octets[0]
        );

        let mut results = std::collections::HashMap::new();
        for server in servers {
            let query = format!("{reversed}.{server}");
            let listed = self
                .a_records(&query)
                .await
                .map(|ips| !ips.is_empty())
                .unwrap_or(false);
            results.insert(server.clone(), listed);
        }
        results
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn organizational_domain(domain: &str) -> &str {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        domain
    } else {
        let start = labels.len() - 2;
        // SAFETY: start is always a valid label boundary
        let byte_offset: usize = labels[..start].iter().map(|l| l.len() + 1).sum();
        &domain[byte_offset..]
    }
}

fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let (network, prefix) = match cidr.split_once('/') {
        Some((net, len)) => (net, len.parse().ok()),
        None => (cidr, None),
    };

    let Ok(network) = network.parse::<IpAddr>() else {
        return false;
    };

    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = prefix.unwrap_or(32u32).min(32);
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = prefix.unwrap_or(128u32).min(128);
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn organizational_domain_trims_to_last_two_labels() {
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("com"), "com");
    }

    #[test]
    fn cidr_matching() {
        assert!(ip_in_cidr(
            "203.0.113.5".parse().unwrap(),
            "203.0.113.0/24"
        ));
        assert!(!ip_in_cidr(
            "203.0.114.5".parse().unwrap(),
            "203.0.113.0/24"
        ));
        assert!(ip_in_cidr("203.0.113.5".parse().unwrap(), "203.0.113.5"));
    }
}
