//! Default platform service entries
//!
//! Every provisioned cluster gets the same six console entries: the git
//! provider plus the platform applications installed by the registry sync.

use crate::store::ServiceListStore;
use crate::types::{Cluster, GitProvider, Service};
use crate::Result;

/// Seed the service list with the platform defaults
///
/// Creates the list lazily and tolerates reruns: entries that already exist
/// are skipped rather than duplicated.
pub async fn add_default_services(cluster: &Cluster, services: &ServiceListStore) -> Result<()> {
    services.create(&cluster.cluster_name).await?;

    let existing: Vec<String> = services
        .get(&cluster.cluster_name)
        .await?
        .services
        .into_iter()
        .map(|s| s.name)
        .collect();

    for entry in default_services(cluster) {
        if existing.contains(&entry.name) {
            continue;
        }
        services.insert(&cluster.cluster_name, entry).await?;
    }
    Ok(())
}

/// The six default entries for a cluster
pub fn default_services(cluster: &Cluster) -> Vec<Service> {
    let domain = cluster.full_domain();
    let owner = &cluster.git_auth.owner;

    let (git_name, git_description, git_image, git_link) = match cluster.git_provider {
        GitProvider::Github => (
            "github",
            "The git repositories contain all the Infrastructure as Code and GitOps configurations.",
            "https://assets.kubefirst.com/console/github.svg",
            format!("https://github.com/{owner}"),
        ),
        GitProvider::Gitlab => (
            "gitlab",
            "The git repositories contain all the Infrastructure as Code and GitOps configurations.",
            "https://assets.kubefirst.com/console/gitlab.svg",
            format!("https://gitlab.com/{owner}"),
        ),
    };

    let service = |name: &str, description: &str, image: &str, links: Vec<String>| Service {
        name: name.to_string(),
        default: true,
        description: description.to_string(),
        image: image.to_string(),
        links,
        status: String::new(),
        created_by: String::new(),
    };

    vec![
        service(git_name, git_description, git_image, vec![git_link]),
        service(
            "Vault",
            "Kubefirst's secrets manager and identity provider.",
            "https://assets.kubefirst.com/console/vault.svg",
            vec![format!("https://vault.{domain}")],
        ),
        service(
            "Argo CD",
            "A GitOps oriented continuous delivery tool for managing all of our applications across our Kubernetes clusters.",
            "https://assets.kubefirst.com/console/argocd.svg",
            vec![format!("https://argocd.{domain}")],
        ),
        service(
            "Argo Workflows",
            "The workflow engine for orchestrating parallel jobs on Kubernetes.",
            "https://assets.kubefirst.com/console/argocd.svg",
            vec![format!("https://argo.{domain}")],
        ),
        service(
            "Atlantis",
            "Kubefirst manages Terraform workflows with Atlantis automation.",
            "https://assets.kubefirst.com/console/atlantis.svg",
            vec![format!("https://atlantis.{domain}")],
        ),
        service(
            "Metaphor",
            "A multi-environment demonstration space for frontend application best practices that is easy to apply to your own projects.",
            "https://assets.kubefirst.com/console/metaphor.svg",
            vec![
                format!("https://metaphor-development.{domain}"),
                format!("https://metaphor-staging.{domain}"),
                format!("https://metaphor-production.{domain}"),
            ],
        ),
    ]
}
