//! Kubernetes Adapters
//!
//! Desired-state store, watch cache and storage-class catalog backed by the
//! Kubernetes API server.

use crate::domain::{
    Record, RecordStore, Selector, StorageClassCatalog, StorageClassInfo, WatchCache,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn list_params(selector: &Selector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

/// Map API errors onto the reconciler's taxonomy
fn map_error<K: Record>(name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: K::KIND.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: K::KIND.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: K::KIND.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

// =============================================================================
// Record Store
// =============================================================================

/// Record store over a cluster-scoped custom resource
pub struct KubeRecordStore<K: Record> {
    api: Api<K>,
}

impl<K: Record> KubeRecordStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl<K: Record> RecordStore<K> for KubeRecordStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        self.api.get_opt(name).await.map_err(|e| map_error::<K>(name, e))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        let list = self
            .api
            .list(&list_params(selector))
            .await
            .map_err(|e| map_error::<K>("*", e))?;
        Ok(list.items)
    }

    async fn create(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        self.api
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| map_error::<K>(&name, e))
    }

    async fn update(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        self.api
            .replace(&name, &PostParams::default(), record)
            .await
            .map_err(|e| map_error::<K>(&name, e))
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        let body = serde_json::to_vec(record)?;
        self.api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_error::<K>(&name, e))
    }

    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        self.api
            .delete(name, &params)
            .await
            .map_err(|e| map_error::<K>(name, e))?;
        debug!("Delete issued for {}/{}", K::KIND, name);
        Ok(())
    }
}

// =============================================================================
// Watch Cache
// =============================================================================

/// Reflector-backed watch cache
pub struct ReflectorCache<K: Record> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: Record> ReflectorCache<K> {
    /// Start watching records matching `selector` until `shutdown` fires
    pub fn spawn(client: Client, selector: &Selector, shutdown: CancellationToken) -> Self {
        let api: Api<K> = Api::all(client);
        let config = if selector.is_empty() {
            watcher::Config::default()
        } else {
            watcher::Config::default().labels(&selector.to_string())
        };

        let (store, writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let flag = synced.clone();
        let stream = watcher(api, config).default_backoff().reflect(writer);

        tokio::spawn(async move {
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Restarted(objects))) => {
                            if !flag.swap(true, Ordering::Relaxed) {
                                info!("{} cache synced with {} records", K::KIND, objects.len());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("{} watch error: {}", K::KIND, e),
                        None => break,
                    },
                }
            }
            debug!("{} watch stopped", K::KIND);
        });

        Self { store, synced }
    }
}

impl<K: Record> WatchCache<K> for ReflectorCache<K> {
    fn list(&self, selector: &Selector) -> Vec<K> {
        self.store
            .state()
            .into_iter()
            .filter(|r| selector.matches(r.labels()))
            .map(|r| (*r).clone())
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Storage-Class Catalog
// =============================================================================

/// Storage classes read from the API server
pub struct KubeStorageClassCatalog {
    api: Api<StorageClass>,
}

impl KubeStorageClassCatalog {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl StorageClassCatalog for KubeStorageClassCatalog {
    async fn list(&self, selector: &Selector) -> Result<Vec<StorageClassInfo>> {
        let classes = self.api.list(&list_params(selector)).await?;
        Ok(classes
            .items
            .into_iter()
            .map(|class| StorageClassInfo {
                name: class.name_any(),
                labels: class.labels().clone(),
                parameters: class.parameters.unwrap_or_default(),
            })
            .collect())
    }
}
