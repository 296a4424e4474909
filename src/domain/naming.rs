//! Resource naming and derivation
//!
//! Pure functions mapping backend resource paths to record names and back.
//! Every mapping must be reversible within the process: the reconciler looks
//! records up by derived name and derives URIs back from record names.

use crate::error::{Error, Result};

const INSTANCE_KIND: &str = "instance";
const SHARE_KIND: &str = "share";

/// Default prefix for instances created by the placement engine
pub const DEFAULT_INSTANCE_PREFIX: &str = "fs-";

// =============================================================================
// Instance URIs
// =============================================================================

/// Parsed `projects/{project}/locations/{location}/instances/{name}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUri {
    pub project: String,
    pub location: String,
    pub name: String,
}

impl InstanceUri {
    /// Parse an instance resource path
    pub fn parse(uri: &str) -> Result<Self> {
        let parts: Vec<&str> = uri.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "instances", name]
                if !project.is_empty() && !location.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    location: location.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(invalid(INSTANCE_KIND, uri, "expected projects/*/locations/*/instances/*")),
        }
    }

    /// Render back to the resource path
    pub fn uri(&self) -> String {
        instance_uri(&self.project, &self.location, &self.name)
    }
}

impl std::fmt::Display for InstanceUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Build an instance resource path
pub fn instance_uri(project: &str, location: &str, name: &str) -> String {
    format!("projects/{}/locations/{}/instances/{}", project, location, name)
}

/// Synthesize the URI of a not-yet-existing instance in `region`
pub fn new_instance_uri(project: &str, region: &str, prefix: &str) -> String {
    instance_uri(project, region, &format!("{}{}", prefix, uuid::Uuid::new_v4()))
}

/// Record name for an instance URI: `{project}.{location}.{instance}`
pub fn instance_record_name(uri: &str) -> Result<String> {
    let parsed = InstanceUri::parse(uri)?;
    if parsed.project.contains(':') {
        return Err(invalid(INSTANCE_KIND, uri, "domain-scoped projects are not supported"));
    }
    if parsed.location.contains('.') || parsed.name.contains('.') {
        return Err(invalid(INSTANCE_KIND, uri, "location and name must not contain '.'"));
    }
    Ok(format!("{}.{}.{}", parsed.project, parsed.location, parsed.name))
}

/// Instance URI for a record name, the inverse of [`instance_record_name`]
pub fn instance_uri_from_record_name(record_name: &str) -> Result<String> {
    let mut parts = record_name.rsplitn(3, '.');
    let name = parts.next().unwrap_or_default();
    let location = parts.next().unwrap_or_default();
    let project = parts.next().unwrap_or_default();
    if project.is_empty() || location.is_empty() || name.is_empty() {
        return Err(invalid(
            INSTANCE_KIND,
            record_name,
            "expected {project}.{location}.{instance}",
        ));
    }
    Ok(instance_uri(project, location, name))
}

// =============================================================================
// Shares
// =============================================================================

/// Split `{instanceURI}/shares/{share}` into the parent URI and share name
pub fn parse_share_uri(uri: &str) -> Result<(String, String)> {
    let (parent, share) = uri
        .rsplit_once("/shares/")
        .ok_or_else(|| invalid(SHARE_KIND, uri, "expected {instance}/shares/{share}"))?;
    if share.is_empty() || share.contains('/') {
        return Err(invalid(SHARE_KIND, uri, "empty or nested share name"));
    }
    InstanceUri::parse(parent)?;
    Ok((parent.to_string(), share.to_string()))
}

/// Record name for a live share name (`pvc_abc` -> `pvc-abc`)
pub fn share_record_name(share_name: &str) -> String {
    share_name.replace('_', "-")
}

/// Live share name for a record name (`pvc-abc` -> `pvc_abc`)
pub fn share_live_name(record_name: &str) -> String {
    record_name.replace('-', "_")
}

// =============================================================================
// Locations
// =============================================================================

/// Region of a location: `us-central1-c` -> `us-central1`, regions map to themselves
pub fn region_from_location(location: &str) -> Result<String> {
    let parts: Vec<&str> = location.split('-').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::RegionResolution {
            location: location.to_string(),
        });
    }
    match parts.len() {
        2 => Ok(location.to_string()),
        3 => Ok(format!("{}-{}", parts[0], parts[1])),
        _ => Err(Error::RegionResolution {
            location: location.to_string(),
        }),
    }
}

fn invalid(kind: &str, name: &str, reason: &str) -> Error {
    Error::InvalidName {
        kind: kind.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
