#![warn(missing_docs)]

//! geoctl replication subsystem: registry-backed primary discovery and
//! attaching a secondary to a primary's replication stream.

pub mod bootstrap;
pub mod error;
pub mod locator;
pub mod slot_registry;
pub mod ssl_mode;

pub use bootstrap::{
    AttachOptions, BackupTarget, BaseBackup, BootstrapConfig, PgBaseBackup,
    ReplicationBootstrapper,
};
pub use error::ReplError;
pub use locator::{
    DnsSrvResolver, PrimaryCandidate, PrimaryLocator, RegistrySettings, SrvResolver, SrvTarget,
};
pub use slot_registry::{ReplicationSlot, SlotRegistry, SlotState};
pub use ssl_mode::SslMode;
