//! Gitops template materialization
//!
//! Turns the upstream gitops-template and metaphor repositories into a
//! cluster's own repositories: clone at `main`, collapse the
//! provider-specific subtree into the canonical layout, detokenize, point
//! `origin` at the destination, and commit. Pushing is a separate call - the
//! destination repositories are created by the git terraform layer between
//! the two.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Error;
use crate::gitops::{clone_branch, commit_all, set_origin, GitBasicAuth};
use crate::render::render_tree;
use crate::types::{CloudProvider, Cluster, GitProvider};
use crate::{Result, KONSTRUCT_OWNER};

/// Commit message for the initial materialized content
const INITIAL_COMMIT_MESSAGE: &str = "committing initial detokenized gitops-template repo content";

/// Registry path for a cluster's applications inside the gitops repository
///
/// | provider | template | path |
/// |---|---|---|
/// | k3d | any | `clusters/<cluster>` |
/// | other | no | `registry/clusters/<cluster>` |
/// | other | yes | `templates/<cluster>` |
pub fn registry_path(provider: CloudProvider, cluster_name: &str, is_template: bool) -> String {
    match (provider, is_template) {
        (CloudProvider::K3d, _) => format!("clusters/{cluster_name}"),
        (_, false) => format!("registry/clusters/{cluster_name}"),
        (_, true) => format!("templates/{cluster_name}"),
    }
}

/// Source repositories for one materialization
#[derive(Clone, Debug)]
pub struct GitopsTemplateSpec {
    /// Gitops template clone URL
    pub gitops_template_url: String,
    /// Metaphor template clone URL
    pub metaphor_template_url: String,
    /// Branch to materialize from
    pub branch: String,
}

impl Default for GitopsTemplateSpec {
    fn default() -> Self {
        Self {
            gitops_template_url: format!(
                "https://github.com/{KONSTRUCT_OWNER}/gitops-template.git"
            ),
            metaphor_template_url: format!("https://github.com/{KONSTRUCT_OWNER}/metaphor.git"),
            branch: "main".to_string(),
        }
    }
}

/// Materializes template repositories for one cluster
pub struct Materializer {
    spec: GitopsTemplateSpec,
}

impl Materializer {
    /// Create a materializer for the given template sources
    pub fn new(spec: GitopsTemplateSpec) -> Self {
        Self { spec }
    }

    /// Clone, adjust, detokenize, and commit the gitops repository
    ///
    /// Leaves the result at `local_dir` with `origin` pointing at
    /// `destination_url`, committed but not pushed. Partial results are left
    /// on disk for inspection; the caller removes them before a retry.
    pub fn prepare_gitops(
        &self,
        cluster: &Cluster,
        tokens: &BTreeMap<String, String>,
        destination_url: &str,
        remove_atlantis: bool,
        local_dir: &Path,
    ) -> Result<()> {
        clone_branch(&self.spec.gitops_template_url, &self.spec.branch, local_dir, None)?;

        collapse_provider_subtree(local_dir, cluster.cloud_provider, cluster.git_provider)?;
        if remove_atlantis {
            remove_atlantis_files(local_dir)?;
        }
        adopt_cluster_layout(local_dir, cluster.cloud_provider, &cluster.cluster_name)?;

        render_tree(local_dir, tokens)?;
        set_origin(local_dir, destination_url)?;
        commit_all(local_dir, INITIAL_COMMIT_MESSAGE)?;
        info!(cluster = %cluster.cluster_name, dir = %local_dir.display(), "gitops repository prepared");
        Ok(())
    }

    /// Clone, adjust, detokenize, and commit the metaphor repository
    pub fn prepare_metaphor(
        &self,
        cluster: &Cluster,
        tokens: &BTreeMap<String, String>,
        destination_url: &str,
        local_dir: &Path,
    ) -> Result<()> {
        clone_branch(
            &self.spec.metaphor_template_url,
            &self.spec.branch,
            local_dir,
            None,
        )?;

        prune_ci_config(local_dir, cluster.git_provider)?;
        render_tree(local_dir, tokens)?;
        set_origin(local_dir, destination_url)?;
        commit_all(local_dir, INITIAL_COMMIT_MESSAGE)?;
        info!(cluster = %cluster.cluster_name, dir = %local_dir.display(), "metaphor repository prepared");
        Ok(())
    }

    /// Push a prepared repository's `main` to its origin
    pub fn push(&self, local_dir: &Path, auth: &GitBasicAuth) -> Result<()> {
        crate::gitops::push_force(local_dir, "origin", &self.spec.branch, auth)
    }
}

/// Move `<cloudProvider>-<gitProvider>/` to the repository root and drop the
/// other provider subtrees
fn collapse_provider_subtree(
    root: &Path,
    cloud: CloudProvider,
    git: GitProvider,
) -> Result<()> {
    let wanted = format!("{cloud}-{git}");
    let source = root.join(&wanted);
    if !source.is_dir() {
        return Err(Error::validation(format!(
            "gitops template has no {wanted} subtree"
        )));
    }

    // delete every other provider-shaped directory at the root
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_dir()
            && name != wanted
            && name != ".git"
            && name.contains('-')
            && is_provider_dir(&name)
        {
            std::fs::remove_dir_all(entry.path())?;
        }
    }

    move_contents(&source, root)?;
    std::fs::remove_dir_all(&source)?;
    debug!(subtree = %wanted, "provider subtree collapsed");
    Ok(())
}

fn is_provider_dir(name: &str) -> bool {
    let Some((cloud, git)) = name.rsplit_once('-') else {
        return false;
    };
    CloudProvider::parse(cloud).is_ok() && matches!(git, "github" | "gitlab")
}

fn move_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if target.exists() {
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(entry.path(), &target)?;
    }
    Ok(())
}

/// Rename the template's placeholder cluster directory to the real name
fn adopt_cluster_layout(root: &Path, cloud: CloudProvider, cluster_name: &str) -> Result<()> {
    let clusters_dir = if cloud == CloudProvider::K3d {
        root.join("clusters")
    } else {
        root.join("registry").join("clusters")
    };
    if !clusters_dir.is_dir() {
        return Err(Error::validation(format!(
            "gitops template has no {} directory",
            clusters_dir.display()
        )));
    }

    // the template ships exactly one placeholder cluster directory
    let placeholder = std::fs::read_dir(&clusters_dir)?
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .ok_or_else(|| Error::validation("gitops template has no placeholder cluster"))?;

    let target = clusters_dir.join(cluster_name);
    if placeholder.path() != target {
        std::fs::rename(placeholder.path(), &target)?;
    }
    Ok(())
}

/// Remove atlantis content when the cluster opts out of plan automation
fn remove_atlantis_files(root: &Path) -> Result<()> {
    let mut doomed = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        if entry
            .file_name()
            .to_string_lossy()
            .contains("atlantis")
        {
            doomed.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }
    for (path, is_dir) in doomed {
        if !path.exists() {
            continue;
        }
        if is_dir {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Keep only the CI configuration matching the git provider
fn prune_ci_config(root: &Path, git: GitProvider) -> Result<()> {
    let doomed: &[&str] = match git {
        GitProvider::Github => &[".gitlab-ci.yml", ".gitlab"],
        GitProvider::Gitlab => &[".github"],
    };
    for name in doomed {
        let path = root.join(name);
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else if path.is_file() {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Every `(provider, isTemplate)` combination resolves exactly per the
    /// registry-path table.
    #[test]
    fn registry_path_rule() {
        use CloudProvider::*;
        let cases = [
            (K3d, false, "clusters/k1"),
            (K3d, true, "clusters/k1"),
            (Civo, false, "registry/clusters/k1"),
            (Civo, true, "templates/k1"),
            (Digitalocean, false, "registry/clusters/k1"),
            (Digitalocean, true, "templates/k1"),
            (Vultr, false, "registry/clusters/k1"),
            (Vultr, true, "templates/k1"),
            (Akamai, false, "registry/clusters/k1"),
            (Akamai, true, "templates/k1"),
            (Google, false, "registry/clusters/k1"),
            (Google, true, "templates/k1"),
            (Aws, false, "registry/clusters/k1"),
            (Aws, true, "templates/k1"),
        ];
        for (provider, is_template, expected) in cases {
            assert_eq!(
                registry_path(provider, "k1", is_template),
                expected,
                "{provider:?} template={is_template}"
            );
        }
    }

    fn scaffold_template(root: &Path, provider_dir: &str, registry_prefix: &str) {
        let subtree = root.join(provider_dir);
        fs::create_dir_all(subtree.join(registry_prefix).join("cluster-template")).unwrap();
        fs::write(
            subtree
                .join(registry_prefix)
                .join("cluster-template")
                .join("registry.yaml"),
            "name: {{clusterName}}",
        )
        .unwrap();
        fs::create_dir_all(subtree.join("terraform")).unwrap();
        fs::write(subtree.join("atlantis.yaml"), "automerge: true").unwrap();
        // a competing provider subtree that must be dropped
        fs::create_dir_all(root.join("vultr-github")).unwrap();
    }

    #[test]
    fn collapse_and_adopt_produce_canonical_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        scaffold_template(root, "civo-github", "registry/clusters");

        collapse_provider_subtree(root, CloudProvider::Civo, GitProvider::Github).unwrap();
        assert!(!root.join("civo-github").exists());
        assert!(!root.join("vultr-github").exists());
        assert!(root.join("terraform").is_dir());

        adopt_cluster_layout(root, CloudProvider::Civo, "k1").unwrap();
        assert!(root.join("registry/clusters/k1/registry.yaml").is_file());
    }

    #[test]
    fn k3d_layout_lives_under_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        scaffold_template(root, "k3d-github", "clusters");

        collapse_provider_subtree(root, CloudProvider::K3d, GitProvider::Github).unwrap();
        adopt_cluster_layout(root, CloudProvider::K3d, "k1").unwrap();
        assert!(root.join("clusters/k1/registry.yaml").is_file());
    }

    #[test]
    fn atlantis_files_removed_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("registry/components/atlantis")).unwrap();
        fs::write(root.join("atlantis.yaml"), "x").unwrap();
        fs::write(root.join("registry/app.yaml"), "y").unwrap();

        remove_atlantis_files(root).unwrap();
        assert!(!root.join("atlantis.yaml").exists());
        assert!(!root.join("registry/components/atlantis").exists());
        assert!(root.join("registry/app.yaml").exists());
    }

    #[test]
    fn metaphor_ci_pruned_per_git_provider() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".github/workflows")).unwrap();
        fs::create_dir_all(root.join(".gitlab")).unwrap();
        fs::write(root.join(".gitlab-ci.yml"), "stages: []").unwrap();

        prune_ci_config(root, GitProvider::Github).unwrap();
        assert!(root.join(".github").exists());
        assert!(!root.join(".gitlab").exists());
        assert!(!root.join(".gitlab-ci.yml").exists());
    }

    #[test]
    fn missing_provider_subtree_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            collapse_provider_subtree(dir.path(), CloudProvider::Civo, GitProvider::Github)
                .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
