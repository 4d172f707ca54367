//! geoctl management subsystem: secondary promotion, dependent service
//! control, migrations and the `geo-ctl` CLI.

pub mod audit_trail;
pub mod cli;
pub mod config;
pub mod confirmation;
pub mod keys;
pub mod lock;
pub mod migration;
pub mod preflight;
pub mod promotion;
pub mod role;
pub mod services;

pub use audit_trail::{AuditEvent, AuditFilter, AuditTrail, AuditTransition};
pub use config::GeoConfig;
pub use confirmation::{CannedAnswers, ConfirmationProvider, Question, TerminalPrompt};
pub use keys::{FsKeyCleaner, KeyCleaner, KeyCleanup};
pub use lock::{LockError, LockGuard, LockRegistry};
pub use migration::{MigrationError, MigrationRun, MigrationRunner};
pub use preflight::{PreflightCheck, PreflightReport, PreflightSuite};
pub use promotion::{
    FailureCategory, PromotionError, PromotionOrchestrator, PromotionParts, PromotionReport,
    PromotionRequest, PromotionState,
};
pub use role::{ClusterNode, LocalRoleFlipper, NodeRole, RoleFlipper};
pub use services::{DependentService, ServiceDependencyController, ServiceError, ServiceSupervisor};
