//! Background reconciliation workers for the Stevedore container image
//! registry.
//!
//! The janitor maintains the registry's invariants between the relational
//! database (the source of truth) and the object storage backend (where
//! blob and manifest bytes live). It hosts a fixed set of jobs, each a
//! discover/process pair driven by the generic [server::JobRunner]:
//! account enforcement and deletion, abandoned upload cleanup, the staged
//! blob/blob-mount/storage sweepers, blob and manifest validation,
//! replica-side manifest sync, image garbage collection, vulnerability
//! scanning, federation announcements, and peer credential rotation.
//!
//! The embedding process provides the database handle, the drivers, the
//! clock, and the Prometheus registry; see [server::Janitor].

pub mod config;
pub mod drivers;
pub mod registry;
pub mod server;
pub mod tools;

pub use config::JanitorConfig;
pub use server::Janitor;
