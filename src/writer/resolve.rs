//! Turning the configured server name into an ordered list of endpoints.
//!
//! Three forms are accepted:
//!
//! * `192.0.2.1:5151` or `[2001:db8::1]:5151`: one fixed endpoint.
//! * `logstash.example.com:5151`: every A/AAAA address, in random order.
//! * `_logstash._tcp.example.com`: SRV records, ordered per RFC 2782.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use rand::Rng;
use rand::seq::SliceRandom;

use super::target::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, thiserror::Error)]
#[error("DNS lookup for {name} failed: {message}")]
pub struct ResolveError {
    pub name: String,
    pub message: String,
}

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError>;
}

/// System resolver configuration (`/etc/resolv.conf`).
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| ResolveError {
                name: "system configuration".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| ResolveError {
            name: host.to_string(),
            message: e.to_string(),
        })?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError> {
        let lookup = self.resolver.srv_lookup(name).await.map_err(|e| ResolveError {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid server name {name:?}: {reason}")]
pub struct InvalidServerName {
    name: String,
    reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerName {
    Static(SocketAddr),
    Host { host: String, port: u16 },
    Srv(String),
}

impl FromStr for ServerName {
    type Err = InvalidServerName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidServerName {
            name: s.to_string(),
            reason,
        };

        if s.is_empty() {
            return Err(invalid("must not be empty"));
        }

        let Some((host, port)) = s.rsplit_once(':') else {
            return Ok(Self::Srv(s.to_string()));
        };

        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(Self::Static(SocketAddr::new(ip, port)));
        }

        if host.is_empty() || host.contains(':') {
            return Err(invalid("host is not a hostname or address literal"));
        }
        Ok(Self::Host {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(addr) => write!(f, "{addr}"),
            Self::Host { host, port } => write!(f, "{host}:{port}"),
            Self::Srv(name) => write!(f, "{name}"),
        }
    }
}

impl ServerName {
    /// Endpoints to try, in order. Lookup failures are logged and produce
    /// an empty list.
    pub async fn candidates(&self, resolver: &dyn Resolve) -> Vec<Target> {
        match self {
            Self::Static(addr) => vec![Target::new(addr.ip().to_string(), addr.port())],
            Self::Host { host, port } => {
                let mut addrs = match resolver.lookup_ip(host).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        log::warn!("LogstashWriter: {e}");
                        Vec::new()
                    }
                };
                if addrs.is_empty() {
                    log::warn!("LogstashWriter: no addresses resolved for {host:?}");
                }
                addrs.shuffle(&mut rand::thread_rng());
                addrs
                    .into_iter()
                    .map(|ip| Target::new(ip.to_string(), *port))
                    .collect()
            }
            Self::Srv(name) => {
                let records = match resolver.lookup_srv(name).await {
                    Ok(records) => records,
                    Err(e) => {
                        log::warn!("LogstashWriter: {e}");
                        Vec::new()
                    }
                };
                if records.is_empty() {
                    log::warn!("LogstashWriter: no SRV records found for {name:?}");
                }
                order_srv(records, &mut rand::thread_rng())
                    .into_iter()
                    .map(|r| Target::new(r.target, r.port))
                    .collect()
            }
        }
    }
}

/// RFC 2782 ordering: lowest priority first; within a priority, repeatedly
/// pick a record at random with probability proportional to its weight.
pub fn order_srv<R: Rng + ?Sized>(mut records: Vec<SrvRecord>, rng: &mut R) -> Vec<SrvRecord> {
    records.sort_by_key(|r| r.priority);

    let mut ordered = Vec::with_capacity(records.len());
    for group in records.chunk_by(|a, b| a.priority == b.priority) {
        let mut candidates = group.to_vec();
        candidates.sort_by(|a, b| (a.weight, &a.target).cmp(&(b.weight, &b.target)));

        while !candidates.is_empty() {
            let total: u32 = candidates.iter().map(|r| u32::from(r.weight)).sum();
            let selector = rng.gen_range(0..=total);
            let mut running = 0u32;
            let chosen = candidates
                .iter()
                .position(|r| {
                    running += u32::from(r.weight);
                    running >= selector
                })
                .unwrap_or(0);
            ordered.push(candidates.remove(chosen));
        }
    }
    ordered
}
