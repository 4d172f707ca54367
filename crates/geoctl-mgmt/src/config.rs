use geoctl_repl::{BootstrapConfig, RegistrySettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub lock_dir: PathBuf,
    pub node: NodeConfig,
    pub registry: RegistrySettings,
    pub replication: BootstrapConfig,
    pub services: ServicesConfig,
    pub migration: MigrationConfig,
    pub preflight: PreflightConfig,
    pub keys: KeysConfig,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/var/opt/geoctl/locks"),
            node: NodeConfig::default(),
            registry: RegistrySettings::default(),
            replication: BootstrapConfig::default(),
            services: ServicesConfig::default(),
            migration: MigrationConfig::default(),
            preflight: PreflightConfig::default(),
            keys: KeysConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub service_address: String,
    pub role_file: PathBuf,
    /// Run before the role file is rewritten, e.g. the database's own promote command.
    pub promote_command: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "geo-node".to_string(),
            service_address: "127.0.0.1:5432".to_string(),
            role_file: PathBuf::from("/var/opt/geoctl/node-role.json"),
            promote_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub start_order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub control_command: Vec<String>,
    pub status_verb: String,
    pub timeout_secs: u64,
    pub dependent: Vec<ServiceSpec>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            control_command: vec!["systemctl".to_string()],
            status_verb: "is-active".to_string(),
            timeout_secs: 60,
            dependent: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub command: Vec<String>,
    pub task: String,
    pub log_prefix: String,
    pub log_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            command: vec!["bundle".to_string(), "exec".to_string(), "rake".to_string()],
            task: "geo:db:migrate".to_string(),
            log_prefix: "geo-promotion-db-migrate".to_string(),
            log_dir: PathBuf::from("/var/log/geoctl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub connect_timeout_secs: u64,
    pub max_replication_lag_secs: u64,
    /// Prints the replication lag in seconds on stdout. Empty disables the check.
    pub lag_command: Vec<String>,
    pub check_registry_primary: bool,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            max_replication_lag_secs: 60,
            lag_command: Vec::new(),
            check_registry_primary: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub stale_key_paths: Vec<PathBuf>,
}

impl GeoConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: GeoConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id.trim().is_empty() {
            anyhow::bail!("node.id must not be empty");
        }
        if self.services.control_command.is_empty() {
            anyhow::bail!("services.control_command must not be empty");
        }
        if self.services.timeout_secs == 0 {
            anyhow::bail!("services.timeout_secs must be greater than zero");
        }
        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for svc in &self.services.dependent {
            if svc.name.trim().is_empty() {
                anyhow::bail!("dependent service name must not be empty");
            }
            if !names.insert(svc.name.as_str()) {
                anyhow::bail!("dependent service {} declared twice", svc.name);
            }
            if !orders.insert(svc.start_order) {
                anyhow::bail!(
                    "dependent service {} reuses start_order {}",
                    svc.name,
                    svc.start_order
                );
            }
        }
        if self.migration.command.is_empty() || self.migration.task.trim().is_empty() {
            anyhow::bail!("migration.command and migration.task must be set");
        }
        Ok(())
    }
}
