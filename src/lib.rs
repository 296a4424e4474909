//! Multishare Reconciler
//!
//! Control-plane reconciler that packs independently sized file shares onto
//! a small number of shared storage instances. It keeps three views in
//! agreement: the desired-state record store, its watch cache and the live
//! cloud inventory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     MultishareReconciler                         │
//! │  ownership ─► shadow ─► pointers ─► placement ─► capacity/retire │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                      Collaborator ports                          │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────┐ ┌─────────────┐  │
//! │  │ RecordStore  │ │  WatchCache  │ │ Catalog  │ │  Inventory  │  │
//! │  └──────┬───────┘ └──────┬───────┘ └────┬─────┘ └──────┬──────┘  │
//! ├─────────┼────────────────┼──────────────┼──────────────┼─────────┤
//! │     Kubernetes API (ShareInfo, InstanceInfo,        Filestore    │
//! │                     StorageClass)                   REST API     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconciler`]: the periodic pass and its components
//! - [`adapters`]: Kubernetes, Filestore and in-memory collaborators
//! - [`crd`]: ShareInfo and InstanceInfo custom resources
//! - [`domain`]: collaborator ports and naming rules
//! - [`server`]: health, readiness, metrics and status endpoints
//! - [`error`]: error types and classification

pub mod adapters;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod server;

// Re-export commonly used types
pub use config::ReconcilerConfig;

pub use crd::{
    InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, ResourceStatus, ShareInfo,
    ShareInfoSpec, ShareInfoStatus,
};

pub use domain::ports::{
    CloudInventory, Instance, ListFilter, Op, RecordStore, Selector, Share, StorageClassCatalog,
    WatchCache,
};

pub use error::{Error, ErrorClass, Result};

pub use metrics::ReconcilerMetrics;

pub use reconciler::{Collaborators, MultishareReconciler, PassReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
