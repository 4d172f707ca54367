//! Registry-backed primary discovery.
//!
//! The service registry publishes the current database primary as an SRV
//! record named `master.<service>.service.<domain>`. [`PrimaryLocator`]
//! queries the registry's local DNS endpoint for that record and resolves each
//! target to an address, keeping the order the resolver returned.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ReplError;

/// Local registry integration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Whether the registry agent runs on this node.
    pub enabled: bool,
    /// DNS endpoint exposed by the registry agent.
    pub dns_addr: SocketAddr,
    /// Registry DNS domain.
    pub domain: String,
    /// Database cluster service name used when none is given explicitly.
    pub service_name: Option<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dns_addr: SocketAddr::from(([127, 0, 0, 1], 8600)),
            domain: "consul".to_string(),
            service_name: None,
        }
    }
}

impl RegistrySettings {
    /// Record name the primary is published under for `service_name`.
    pub fn primary_record(&self, service_name: &str) -> String {
        format!("master.{}.service.{}", service_name, self.domain)
    }
}

/// One SRV answer: the target host name and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Target host name as published in the record.
    pub target: String,
    /// Service port.
    pub port: u16,
}

/// A resolved primary candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryCandidate {
    /// Resolved address of the SRV target.
    pub host: IpAddr,
    /// Port from the SRV record.
    pub port: u16,
}

impl PrimaryCandidate {
    /// Candidate as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for PrimaryCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// DNS capability used by the locator.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Query SRV records for `name`. An empty answer is `Ok(vec![])`.
    async fn srv_records(&self, name: &str) -> Result<Vec<SrvTarget>, ResolveError>;

    /// Resolve an SRV target to an address.
    async fn resolve_address(&self, target: &str) -> Result<IpAddr, ResolveError>;
}

/// [`SrvResolver`] backed by hickory, bound to a single name server.
pub struct DnsSrvResolver {
    resolver: TokioAsyncResolver,
}

impl DnsSrvResolver {
    /// Create a resolver that only talks to `dns_addr`.
    pub fn new(dns_addr: SocketAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(dns_addr, Protocol::Udp));
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }
}

#[async_trait]
impl SrvResolver for DnsSrvResolver {
    async fn srv_records(&self, name: &str) -> Result<Vec<SrvTarget>, ResolveError> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvTarget {
                    target: srv.target().to_utf8(),
                    port: srv.port(),
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn resolve_address(&self, target: &str) -> Result<IpAddr, ResolveError> {
        let lookup = self.resolver.lookup_ip(target).await?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| ResolveError::from(format!("no address records for {}", target)))
    }
}

/// Resolves the cluster member currently holding the primary role.
pub struct PrimaryLocator {
    settings: RegistrySettings,
    resolver: Arc<dyn SrvResolver>,
}

impl PrimaryLocator {
    /// Create a locator using the registry DNS endpoint from `settings`.
    pub fn new(settings: RegistrySettings) -> Self {
        let resolver = Arc::new(DnsSrvResolver::new(settings.dns_addr));
        Self { settings, resolver }
    }

    /// Create a locator with an explicit resolver.
    pub fn with_resolver(settings: RegistrySettings, resolver: Arc<dyn SrvResolver>) -> Self {
        Self { settings, resolver }
    }

    /// Registry settings in use.
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Resolve the primary for `service_name`, in resolver order.
    pub async fn resolve(&self, service_name: &str) -> Result<Vec<PrimaryCandidate>, ReplError> {
        if !self.settings.enabled {
            return Err(ReplError::config(
                "registry agent is not enabled on this node",
            ));
        }
        if service_name.trim().is_empty() {
            return Err(ReplError::config("database service name is not defined"));
        }

        let query = self.settings.primary_record(service_name);
        debug!(query = %query, "querying registry for primary");
        let records = self.resolver.srv_records(&query).await?;

        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            let host = self.resolver.resolve_address(&record.target).await?;
            candidates.push(PrimaryCandidate {
                host,
                port: record.port,
            });
        }

        if candidates.is_empty() {
            return Err(ReplError::NotFound { query });
        }
        info!(query = %query, candidates = candidates.len(), "primary resolved");
        Ok(candidates)
    }

    /// Resolve the primary for the configured service name.
    pub async fn resolve_configured(&self) -> Result<Vec<PrimaryCandidate>, ReplError> {
        let service = self.settings.service_name.clone().unwrap_or_default();
        self.resolve(&service).await
    }
}
