//! kubefirst-api - control plane for GitOps-managed platform clusters
//!
//! This service provisions and tears down opinionated Kubernetes platform
//! clusters across cloud providers, materializing a GitOps stack around each
//! one: a gitops/metaphor repository pair, a continuous-delivery controller
//! (Argo CD), a secret store (Vault), and a catalog of on-demand
//! applications.
//!
//! # Architecture
//!
//! The core is a checkpointed lifecycle state machine: each externally
//! observable provisioning step flips one durable boolean on the cluster
//! record, persisted after every transition, so a restarted process resumes
//! from the highest completed checkpoint. Cluster records live in Kubernetes
//! Secrets — the service runs in-cluster and needs no external database.
//!
//! # Modules
//!
//! - [`types`] - Cluster records, checkpoints, request/response types
//! - [`store`] - Secret-backed cluster and service-list stores
//! - [`render`] - `{{token}}` substitution over rendered file trees
//! - [`gitops`] - Template repository materialization (clone, detokenize, push)
//! - [`provider`] - Cloud driver abstraction and per-provider implementations
//! - [`terraform`] - Terraform init/apply/destroy runner
//! - [`k8s`] - Kubernetes client helpers, readiness waits, port-forwards
//! - [`argocd`] - Argo CD application management
//! - [`vault`] - Vault initialization and KV seeding
//! - [`catalog`] - Gitops catalog index reader and refresh scheduler
//! - [`services`] - Catalog application installer and service list seeding
//! - [`lifecycle`] - The cluster lifecycle controller (create/delete)
//! - [`router`] - HTTP API surface
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod argocd;
pub mod catalog;
pub mod env;
pub mod error;
pub mod gitops;
pub mod k8s;
pub mod lifecycle;
pub mod provider;
pub mod render;
pub mod router;
pub mod services;
pub mod store;
pub mod terraform;
pub mod types;
pub mod vault;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names and namespaces
// =============================================================================
// Persisted state layout is part of the compatibility surface: operators and
// the console locate these objects by name.

/// Namespace holding all kubefirst cluster and service records
pub const KUBEFIRST_NAMESPACE: &str = "kubefirst";

/// Prefix for cluster record Secrets (`kubefirst-clusters-<clusterName>`)
pub const CLUSTER_SECRET_PREFIX: &str = "kubefirst-clusters";

/// Prefix for service list Secrets (`kubefirst-service-<clusterName>`)
pub const SERVICE_SECRET_PREFIX: &str = "kubefirst-service";

/// Label selector applied to every record Secret so `list` can enumerate them
pub const SECRET_TYPE_LABEL: &str = "kubefirst.konstruct.io/secret-type";

/// Namespace of the in-cluster secret store
pub const VAULT_NAMESPACE: &str = "vault";

/// Secret holding the Vault root token and recovery keys
pub const VAULT_UNSEAL_SECRET: &str = "vault-unseal-secret";

/// Namespace of the continuous-delivery controller
pub const ARGOCD_NAMESPACE: &str = "argocd";

/// Upstream source repository for the gitops catalog
pub const GITOPS_CATALOG_REPO: &str = "gitops-catalog";

/// Owner of the upstream catalog and template repositories
pub const KONSTRUCT_OWNER: &str = "konstructio";
