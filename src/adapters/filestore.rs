//! Filestore REST Inventory
//!
//! Lists instances, shares and operations from the Filestore v1 REST API.
//! Listings are paginated with `pageToken`; HTTP failures are mapped to
//! canonical status codes so retryable ones surface as temporary errors.

use crate::domain::{CloudInventory, Instance, ListFilter, Op, Share};
use crate::error::{Error, Result, StatusCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default API endpoint
pub const DEFAULT_ENDPOINT: &str = "https://file.googleapis.com/v1";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const GIB: u64 = 1 << 30;

/// Refresh cached tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Filestore inventory client
#[derive(Debug, Clone)]
pub struct FilestoreConfig {
    /// API base URL
    pub endpoint: String,
    /// Static bearer token; the metadata server is queried when unset
    pub access_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for FilestoreConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// int64 fields arrive as JSON strings
fn u64_from_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Number(n)) => Ok(n),
        Some(Raw::Text(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "u64_from_string")]
    capacity_gb: u64,
    #[serde(default, deserialize_with = "u64_from_string")]
    capacity_step_size_gb: u64,
    #[serde(default)]
    tier: String,
    #[serde(default)]
    networks: Vec<NetworkConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkConfig {
    #[serde(default)]
    reserved_ip_range: String,
}

impl From<InstanceResource> for Instance {
    fn from(r: InstanceResource) -> Self {
        Instance {
            name: r.name,
            capacity_bytes: r.capacity_gb.saturating_mul(GIB),
            capacity_step_size_bytes: r.capacity_step_size_gb.saturating_mul(GIB),
            state: r.state,
            labels: r.labels,
            reserved_ip_range: r
                .networks
                .into_iter()
                .next()
                .map(|n| n.reserved_ip_range)
                .unwrap_or_default(),
            tier: r.tier,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareResource {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "u64_from_string")]
    capacity_gb: u64,
    #[serde(default)]
    mount_name: String,
}

impl From<ShareResource> for Share {
    fn from(r: ShareResource) -> Self {
        Share {
            name: r.name,
            capacity_bytes: r.capacity_gb.saturating_mul(GIB),
            state: r.state,
            labels: r.labels,
            mount_name: r.mount_name,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    #[serde(default)]
    target: String,
    #[serde(default)]
    verb: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationResource {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    metadata: OperationMetadata,
    error: Option<OperationStatus>,
}

impl From<OperationResource> for Op {
    fn from(r: OperationResource) -> Self {
        Op {
            id: r.name,
            op_type: r.metadata.verb,
            target: r.metadata.target,
            done: r.done,
            error: r.error.map(|e| format!("code {}: {}", e.code, e.message)),
        }
    }
}

/// One page of a list response
trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

macro_rules! page {
    ($name:ident, $field:ident, $item:ty) => {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct $name {
            #[serde(default)]
            $field: Vec<$item>,
            next_page_token: Option<String>,
        }

        impl Page for $name {
            type Item = $item;
            fn into_parts(self) -> (Vec<$item>, Option<String>) {
                (self.$field, self.next_page_token.filter(|t| !t.is_empty()))
            }
        }
    };
}

page!(InstancePage, instances, InstanceResource);
page!(SharePage, shares, ShareResource);
page!(OperationPage, operations, OperationResource);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

// =============================================================================
// Client
// =============================================================================

/// Cloud inventory backed by the Filestore REST API
pub struct FilestoreInventory {
    config: FilestoreConfig,
    client: Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl FilestoreInventory {
    pub fn new(config: FilestoreConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }
        let cached = self.token.lock().clone();
        if let Some((token, expires)) = cached {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < expires {
                return Ok(token);
            }
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let response = check_status(response).await?;
        let token: MetadataToken = response.json().await?;
        let expires = Instant::now() + Duration::from_secs(token.expires_in);
        *self.token.lock() = Some((token.access_token.clone(), expires));
        Ok(token.access_token)
    }

    /// Fetch every page of a collection
    async fn list_all<P: Page>(&self, path: &str) -> Result<Vec<P::Item>> {
        let token = self.bearer_token().await?;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path);
            if let Some(t) = &page_token {
                url.push_str(&format!("?pageToken={}", urlencoding::encode(t)));
            }
            debug!("GET {}", url);
            let response = self.client.get(&url).bearer_auth(&token).send().await?;
            let page: P = check_status(response).await?.json().await?;
            let (mut batch, next) = page.into_parts();
            items.append(&mut batch);
            match next {
                Some(next) => page_token = Some(next),
                None => return Ok(items),
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    Err(Error::from_backend(StatusCode::from_http(status.as_u16()), message))
}

fn parent(filter: &ListFilter) -> String {
    format!("projects/{}/locations/{}", filter.project, filter.location)
}

#[async_trait]
impl CloudInventory for FilestoreInventory {
    async fn list_instances(&self, filter: &ListFilter) -> Result<Vec<Instance>> {
        let path = format!("{}/instances", parent(filter));
        let items = self.list_all::<InstancePage>(&path).await?;
        Ok(items.into_iter().map(Instance::from).collect())
    }

    async fn list_shares(&self, filter: &ListFilter) -> Result<Vec<Share>> {
        let path = match &filter.instance_uri {
            Some(uri) => format!("{}/shares", uri),
            None => format!("{}/instances/-/shares", parent(filter)),
        };
        let items = self.list_all::<SharePage>(&path).await?;
        Ok(items.into_iter().map(Share::from).collect())
    }

    async fn list_operations(&self, filter: &ListFilter) -> Result<Vec<Op>> {
        let path = format!("{}/operations", parent(filter));
        let items = self.list_all::<OperationPage>(&path).await?;
        Ok(items.into_iter().map(Op::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_page_parsing() {
        let raw = r#"{
            "instances": [{
                "name": "projects/p/locations/us-central1/instances/fs-1",
                "state": "READY",
                "tier": "ENTERPRISE",
                "capacityGb": "1024",
                "capacityStepSizeGb": "256",
                "labels": {"storage_gke_io_cluster_name": "prod"},
                "networks": [{"reservedIpRange": "10.0.0.0/26"}]
            }],
            "nextPageToken": "abc"
        }"#;
        let page: InstancePage = serde_json::from_str(raw).unwrap();
        let (items, next) = page.into_parts();
        assert_eq!(next.as_deref(), Some("abc"));

        let instance = Instance::from(items.into_iter().next().unwrap());
        assert_eq!(instance.capacity_bytes, 1 << 40);
        assert_eq!(instance.capacity_step_size_bytes, 256 << 30);
        assert_eq!(instance.reserved_ip_range, "10.0.0.0/26");
        assert_eq!(instance.labels["storage_gke_io_cluster_name"], "prod");
    }

    #[test]
    fn test_share_page_without_token() {
        let raw = r#"{"shares": [{
            "name": "projects/p/locations/us-central1/instances/fs-1/shares/pvc_1",
            "capacityGb": 100,
            "state": "CREATING",
            "mountName": "pvc_1"
        }], "nextPageToken": ""}"#;
        let page: SharePage = serde_json::from_str(raw).unwrap();
        let (items, next) = page.into_parts();
        assert!(next.is_none());
        let share = Share::from(items.into_iter().next().unwrap());
        assert_eq!(share.capacity_bytes, 100 << 30);
        assert_eq!(share.state, "CREATING");
    }

    #[test]
    fn test_operation_parsing() {
        let raw = r#"{"operations": [
            {"name": "op-1", "done": false,
             "metadata": {"target": "projects/p/locations/l/instances/i", "verb": "update"}},
            {"name": "op-2", "done": true,
             "metadata": {"target": "projects/p/locations/l/instances/j", "verb": "create"},
             "error": {"code": 8, "message": "quota exceeded"}}
        ]}"#;
        let page: OperationPage = serde_json::from_str(raw).unwrap();
        let ops: Vec<Op> = page.into_parts().0.into_iter().map(Op::from).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op_type, "update");
        assert!(ops[0].error.is_none());
        assert_eq!(ops[1].error.as_deref(), Some("code 8: quota exceeded"));
    }

    #[test]
    fn test_empty_page() {
        let page: SharePage = serde_json::from_str("{}").unwrap();
        let (items, next) = page.into_parts();
        assert!(items.is_empty());
        assert!(next.is_none());
    }
}
