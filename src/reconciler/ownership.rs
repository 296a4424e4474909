//! Ownership Filter
//!
//! Selects the live instances and shares that belong to this cluster. An
//! instance is owned when its cluster-location, cluster-name and pool-tag
//! labels match; a share is owned when its parent instance is owned.

use crate::config::ReconcilerConfig;
use crate::domain::naming;
use crate::domain::{Instance, Share};
use crate::error::Result;
use std::collections::BTreeMap;
use tracing::debug;

/// Live-instance label holding the cluster location
pub const CLUSTER_LOCATION_LABEL: &str = "storage_gke_io_cluster_location";

/// Live-instance label holding the cluster name
pub const CLUSTER_NAME_LABEL: &str = "storage_gke_io_cluster_name";

/// Live-instance label holding the instance pool tag
pub const INSTANCE_POOL_TAG_LABEL: &str = "storage_gke_io_instance_pool_tag";

// =============================================================================
// Cluster Identity
// =============================================================================

/// Static identity the reconciler filters inventory by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub name: String,
    pub location: String,
    pub regional: bool,
}

impl ClusterIdentity {
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            name: config.cluster_name.clone(),
            location: config.cluster_location.clone(),
            regional: config.regional,
        }
    }

    /// Location label value instances of this cluster carry
    pub fn expected_location(&self) -> Result<String> {
        if self.regional {
            naming::region_from_location(&self.location)
        } else {
            Ok(self.location.clone())
        }
    }
}

// =============================================================================
// Owned Inventory
// =============================================================================

/// Live inventory owned by this cluster
#[derive(Debug, Clone, Default)]
pub struct OwnedInventory {
    /// Instance URI -> live instance
    pub instances: BTreeMap<String, Instance>,
    /// Shares whose parent is an owned instance
    pub shares: Vec<Share>,
    /// Instance URI -> its live shares
    pub shares_by_instance: BTreeMap<String, Vec<Share>>,
}

impl OwnedInventory {
    /// Live shares under an instance
    pub fn shares_of(&self, instance_uri: &str) -> &[Share] {
        self.shares_by_instance
            .get(instance_uri)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the instance is live and owned
    pub fn has_instance(&self, instance_uri: &str) -> bool {
        self.instances.contains_key(instance_uri)
    }

    /// Whether a share with this record name is live under the instance
    pub fn has_share(&self, instance_uri: &str, share_record_name: &str) -> bool {
        self.shares_of(instance_uri).iter().any(|s| {
            naming::parse_share_uri(&s.name)
                .map(|(_, live)| naming::share_record_name(&live) == share_record_name)
                .unwrap_or(false)
        })
    }

    /// Pool tag label of an owned instance
    pub fn pool_tag_of(&self, instance_uri: &str) -> Option<&str> {
        self.instances
            .get(instance_uri)
            .and_then(|i| i.labels.get(INSTANCE_POOL_TAG_LABEL))
            .map(String::as_str)
    }
}

/// Filter live inventory down to what this cluster owns.
///
/// Fails without filtering anything when the cluster location cannot be
/// normalized, since ownership cannot be established safely then.
pub fn filter_owned(
    identity: &ClusterIdentity,
    instances: Vec<Instance>,
    shares: Vec<Share>,
) -> Result<OwnedInventory> {
    let location = identity.expected_location()?;
    let mut owned = OwnedInventory::default();

    for instance in instances {
        if let Err(reason) = check_labels(&instance, identity, &location) {
            debug!("Ignoring instance {}: {}", instance.name, reason);
            continue;
        }
        if let Err(e) = naming::InstanceUri::parse(&instance.name) {
            debug!("Ignoring instance {}: {}", instance.name, e);
            continue;
        }
        owned.instances.insert(instance.name.clone(), instance);
    }

    for share in shares {
        let parent = match naming::parse_share_uri(&share.name) {
            Ok((parent, _)) => parent,
            Err(e) => {
                debug!("Ignoring share {}: {}", share.name, e);
                continue;
            }
        };
        if !owned.instances.contains_key(&parent) {
            continue;
        }
        owned
            .shares_by_instance
            .entry(parent)
            .or_default()
            .push(share.clone());
        owned.shares.push(share);
    }

    Ok(owned)
}

fn check_labels(
    instance: &Instance,
    identity: &ClusterIdentity,
    location: &str,
) -> std::result::Result<(), String> {
    let label = |key: &str| instance.labels.get(key).map(String::as_str);

    match label(CLUSTER_LOCATION_LABEL) {
        Some(l) if l == location => {}
        Some(l) => return Err(format!("location label {:?} != {:?}", l, location)),
        None => return Err("missing cluster location label".into()),
    }
    match label(CLUSTER_NAME_LABEL) {
        Some(n) if n == identity.name => {}
        Some(n) => return Err(format!("cluster label {:?} != {:?}", n, identity.name)),
        None => return Err("missing cluster name label".into()),
    }
    match label(INSTANCE_POOL_TAG_LABEL) {
        Some(t) if !t.is_empty() => Ok(()),
        _ => Err("missing instance pool tag label".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            name: "prod".into(),
            location: "us-central1-c".into(),
            regional: false,
        }
    }

    fn instance(name: &str, location_label: &str, cluster: &str, tag: &str) -> Instance {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LOCATION_LABEL.to_string(), location_label.to_string());
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.to_string());
        if !tag.is_empty() {
            labels.insert(INSTANCE_POOL_TAG_LABEL.to_string(), tag.to_string());
        }
        Instance {
            name: format!("projects/p/locations/us-central1/instances/{}", name),
            state: "READY".into(),
            labels,
            ..Default::default()
        }
    }

    fn share(instance: &str, name: &str) -> Share {
        Share {
            name: format!(
                "projects/p/locations/us-central1/instances/{}/shares/{}",
                instance, name
            ),
            capacity_bytes: 100 << 30,
            state: "READY".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_owned_instance_with_two_shares() {
        let owned = filter_owned(
            &identity(),
            vec![instance("fs-1", "us-central1-c", "prod", "tag-a")],
            vec![share("fs-1", "pvc_1"), share("fs-1", "pvc_2")],
        )
        .unwrap();

        let uri = "projects/p/locations/us-central1/instances/fs-1";
        assert_eq!(owned.instances.len(), 1);
        assert_eq!(owned.shares.len(), 2);
        assert_eq!(owned.shares_of(uri).len(), 2);
        assert!(owned.has_share(uri, "pvc-1"));
        assert_eq!(owned.pool_tag_of(uri), Some("tag-a"));
    }

    #[test]
    fn test_mismatched_label_excludes_shares() {
        let owned = filter_owned(
            &identity(),
            vec![
                instance("fs-1", "us-central1-c", "other-cluster", "tag-a"),
                instance("fs-2", "us-central1-c", "prod", "tag-a"),
            ],
            vec![share("fs-1", "pvc_1"), share("fs-2", "pvc_2")],
        )
        .unwrap();

        assert_eq!(owned.instances.len(), 1);
        assert_eq!(owned.shares.len(), 1);
        assert!(owned
            .shares_of("projects/p/locations/us-central1/instances/fs-1")
            .is_empty());
    }

    #[test]
    fn test_missing_pool_tag_is_dropped() {
        let owned = filter_owned(
            &identity(),
            vec![instance("fs-1", "us-central1-c", "prod", "")],
            vec![share("fs-1", "pvc_1")],
        )
        .unwrap();
        assert!(owned.instances.is_empty());
        assert!(owned.shares.is_empty());
    }

    #[test]
    fn test_unresolvable_share_parent_is_dropped() {
        let mut orphan = share("fs-1", "pvc_1");
        orphan.name = "garbage".into();
        let owned = filter_owned(
            &identity(),
            vec![instance("fs-1", "us-central1-c", "prod", "tag-a")],
            vec![orphan],
        )
        .unwrap();
        assert_eq!(owned.instances.len(), 1);
        assert!(owned.shares.is_empty());
    }

    #[test]
    fn test_regional_identity_uses_region() {
        let mut identity = identity();
        identity.regional = true;
        let owned = filter_owned(
            &identity,
            vec![
                instance("fs-1", "us-central1", "prod", "tag-a"),
                instance("fs-2", "us-central1-c", "prod", "tag-a"),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(owned.instances.len(), 1);
        assert!(owned
            .instances
            .contains_key("projects/p/locations/us-central1/instances/fs-1"));
    }

    #[test]
    fn test_region_failure_is_fatal() {
        let identity = ClusterIdentity {
            name: "prod".into(),
            location: "nowhere".into(),
            regional: true,
        };
        let result = filter_owned(
            &identity,
            vec![instance("fs-1", "nowhere", "prod", "tag-a")],
            vec![],
        );
        assert_matches!(result, Err(Error::RegionResolution { .. }));
    }

    #[test]
    fn test_empty_inventory() {
        let owned = filter_owned(&identity(), vec![], vec![]).unwrap();
        assert!(owned.instances.is_empty());
        assert!(owned.shares.is_empty());
        assert!(owned.shares_by_instance.is_empty());
    }
}
