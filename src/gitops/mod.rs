//! Git operations for gitops materialization
//!
//! Thin wrappers over `git2` used by the materializer and the catalog
//! installer: authenticated clone, stage-everything commit, force push, and
//! fast-forward pull.

mod materialize;

pub use materialize::{registry_path, GitopsTemplateSpec, Materializer};

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature};
use tracing::info;

use crate::error::Error;
use crate::Result;

/// Basic auth used for https remotes
#[derive(Clone, Debug)]
pub struct GitBasicAuth {
    /// Username the token belongs to
    pub username: String,
    /// API + push token
    pub token: String,
}

fn auth_callbacks(auth: &GitBasicAuth) -> RemoteCallbacks<'static> {
    let username = auth.username.clone();
    let token = auth.token.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        let user = if username.is_empty() {
            username_from_url.unwrap_or("git")
        } else {
            username.as_str()
        };
        Cred::userpass_plaintext(user, &token)
    });
    callbacks
}

/// Clone `url` at `branch` into `path`
pub fn clone_branch(
    url: &str,
    branch: &str,
    path: &Path,
    auth: Option<&GitBasicAuth>,
) -> Result<Repository> {
    let mut fetch_options = FetchOptions::new();
    if let Some(auth) = auth {
        fetch_options.remote_callbacks(auth_callbacks(auth));
    }

    let mut builder = RepoBuilder::new();
    builder.branch(branch).fetch_options(fetch_options);
    info!(url = %url, branch = %branch, "cloning repository");
    Ok(builder.clone(url, path)?)
}

/// Point the repository's `origin` remote at a new destination
pub fn set_origin(repo_path: &Path, destination_url: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    if repo.find_remote("origin").is_ok() {
        repo.remote_delete("origin")?;
    }
    repo.remote("origin", destination_url)?;
    Ok(())
}

/// Stage the whole worktree and commit
pub fn commit_all(repo_path: &Path, message: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now("kbot", "kbot@kubefirst.io")?;

    match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
        Some(parent) => {
            repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;
        }
        None => {
            repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[])?;
        }
    }
    info!(repo = %repo_path.display(), message = %message, "committed");
    Ok(())
}

/// Force-push `branch` to `remote`
pub fn push_force(repo_path: &Path, remote: &str, branch: &str, auth: &GitBasicAuth) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut remote = repo.find_remote(remote)?;

    let mut push_options = PushOptions::new();
    push_options.remote_callbacks(auth_callbacks(auth));

    let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
    remote.push(&[refspec.as_str()], Some(&mut push_options))?;
    info!(repo = %repo_path.display(), branch = %branch, "pushed");
    Ok(())
}

/// Fast-forward `branch` from `remote`
///
/// Diverged histories are an error: local materialization clones fresh and
/// only ever advances, so a non-fast-forward means someone rewrote the
/// remote under us.
pub fn pull_fast_forward(
    repo_path: &Path,
    remote: &str,
    branch: &str,
    auth: &GitBasicAuth,
) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut remote = repo.find_remote(remote)?;

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(auth_callbacks(auth));
    remote.fetch(&[branch], Some(&mut fetch_options), None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_up_to_date() {
        return Ok(());
    }
    if analysis.is_fast_forward() {
        let refname = format!("refs/heads/{branch}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(fetch_commit.id(), "fast-forward pull")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        return Ok(());
    }
    Err(Error::provider(format!(
        "cannot fast-forward {branch} in {}: histories diverged",
        repo_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo(path: &Path) -> Repository {
        let repo = Repository::init(path).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "kbot").unwrap();
            config.set_str("user.email", "kbot@kubefirst.io").unwrap();
        }
        repo
    }

    #[test]
    fn commit_all_creates_initial_and_followup_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        fs::write(dir.path().join("a.yaml"), "a: 1").unwrap();
        commit_all(dir.path(), "committing initial detokenized gitops-template repo content")
            .unwrap();
        let first = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(
            first.message().unwrap(),
            "committing initial detokenized gitops-template repo content"
        );
        assert_eq!(first.parent_count(), 0);

        fs::write(dir.path().join("b.yaml"), "b: 2").unwrap();
        commit_all(dir.path(), "adding postgres to the cluster k1 on behalf of kbot").unwrap();
        let second = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(second.parent_count(), 1);
    }

    #[test]
    fn set_origin_replaces_existing_remote() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        repo.remote("origin", "https://github.com/konstructio/gitops-template.git")
            .unwrap();

        set_origin(dir.path(), "https://github.com/acme/gitops.git").unwrap();

        let remote = repo.find_remote("origin").unwrap();
        assert_eq!(remote.url(), Some("https://github.com/acme/gitops.git"));
    }
}
