//! Collaborator adapters
//!
//! - [`kube_store`]: record store, watch cache and storage classes on Kubernetes
//! - [`filestore`]: cloud inventory over the Filestore REST API
//! - [`memory`]: in-process implementations for standalone runs and tests

pub mod filestore;
pub mod kube_store;
pub mod memory;

pub use filestore::{FilestoreConfig, FilestoreInventory};
pub use kube_store::{KubeRecordStore, KubeStorageClassCatalog, ReflectorCache};
pub use memory::{MemoryCatalog, MemoryInventory, MemoryRecordStore};
