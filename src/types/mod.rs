//! Request, record, and catalog types
//!
//! Everything here crosses a serialization boundary: the HTTP API, the
//! Secret-backed stores, or the upstream catalog index. Field names follow
//! the wire format those boundaries already use.

mod catalog;
mod cluster;

pub use catalog::{
    CatalogAppKey, CatalogAppValue, GitopsCatalogApp, GitopsCatalogAppCreateRequest,
    GitopsCatalogAppDeleteRequest, GitopsCatalogApps,
};
pub use cluster::{
    AkamaiAuth, Checkpoint, Checkpoints, CivoAuth, CloudProvider, CloudflareAuth, Cluster,
    ClusterDefinition, ClusterStatus, ClusterType, DigitaloceanAuth, GitAuth, GitProtocol,
    GitProvider, GoogleAuth, StateStoreCredentials, StateStoreDetails, VultrAuth,
};

use serde::{Deserialize, Serialize};

/// A platform service installed on a cluster, shown in the console
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    /// Service name; unique within a cluster's service list
    pub name: String,
    /// Default services are seeded at provisioning time and cannot be removed
    pub default: bool,
    /// Human description shown in the console
    pub description: String,
    /// Logo image URL
    pub image: String,
    /// Public URLs the service exposes
    pub links: Vec<String>,
    /// Installation status
    pub status: String,
    /// Who requested the installation
    #[serde(default)]
    pub created_by: String,
}

/// Per-cluster list of installed services
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterServiceList {
    /// Cluster the list belongs to
    pub cluster_name: String,
    /// Ordered service entries
    pub services: Vec<Service>,
}
