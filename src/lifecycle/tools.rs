//! Tool binary downloads
//!
//! The controller shells out to terraform, kubectl, and (locally) mkcert and
//! k3d. Binaries are fetched once per cluster from pinned release URLs
//! parameterized by OS/ARCH and dropped into the cluster's tools directory.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Error;
use crate::types::CloudProvider;
use crate::Result;

/// Pinned terraform release
pub const TERRAFORM_VERSION: &str = "1.5.7";
/// Pinned kubectl release
pub const KUBECTL_VERSION: &str = "v1.30.2";
/// Pinned mkcert release
pub const MKCERT_VERSION: &str = "v1.4.4";
/// Pinned k3d release
pub const K3D_VERSION: &str = "v5.6.3";

fn local_os() -> &'static str {
    std::env::consts::OS
}

fn local_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// URLs for every tool a provider needs, in download order
fn tool_downloads(provider: CloudProvider) -> Vec<(&'static str, String)> {
    let os = local_os();
    let arch = local_arch();

    let mut tools = vec![
        (
            "terraform",
            format!(
                "https://releases.hashicorp.com/terraform/{v}/terraform_{v}_{os}_{arch}.zip",
                v = TERRAFORM_VERSION
            ),
        ),
        (
            "kubectl",
            format!("https://dl.k8s.io/release/{KUBECTL_VERSION}/bin/{os}/{arch}/kubectl"),
        ),
    ];

    if provider == CloudProvider::K3d {
        tools.push((
            "mkcert",
            format!(
                "https://github.com/FiloSottile/mkcert/releases/download/{v}/mkcert-{v}-{os}-{arch}",
                v = MKCERT_VERSION
            ),
        ));
        tools.push((
            "k3d",
            format!(
                "https://github.com/k3d-io/k3d/releases/download/{K3D_VERSION}/k3d-{os}-{arch}"
            ),
        ));
    }
    tools
}

/// Download every tool the provider needs into `tools_dir`
///
/// Skips binaries that already exist, so a resumed run costs nothing.
pub async fn download_tools(provider: CloudProvider, tools_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(tools_dir)?;
    let http = reqwest::Client::builder()
        .user_agent("kubefirst-api")
        .build()?;

    for (name, url) in tool_downloads(provider) {
        let target = tools_dir.join(name);
        if target.is_file() {
            info!(tool = name, "already downloaded, skipping");
            continue;
        }

        info!(tool = name, url = %url, "downloading");
        let bytes = http
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::provider(format!("downloading {name}: {e}")))?
            .bytes()
            .await?;

        if url.ends_with(".zip") {
            extract_zip_binary(&bytes, name, &target)?;
        } else {
            std::fs::write(&target, &bytes)?;
        }
        make_executable(&target)?;
    }
    Ok(())
}

/// Pull a single named binary out of a release zip
fn extract_zip_binary(archive: &[u8], binary_name: &str, target: &PathBuf) -> Result<()> {
    let reader = std::io::Cursor::new(archive);
    let mut zip = zip::ZipArchive::new(reader)
        .map_err(|e| Error::provider(format!("reading {binary_name} archive: {e}")))?;
    let mut file = zip
        .by_name(binary_name)
        .map_err(|e| Error::provider(format!("{binary_name} missing from archive: {e}")))?;
    let mut contents = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut contents)?;
    std::fs::write(target, contents)?;
    Ok(())
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cloud_providers_need_terraform_and_kubectl_only() {
        let names: Vec<_> = tool_downloads(CloudProvider::Civo)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["terraform", "kubectl"]);
    }

    #[test]
    fn local_provider_adds_mkcert_and_k3d() {
        let names: Vec<_> = tool_downloads(CloudProvider::K3d)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["terraform", "kubectl", "mkcert", "k3d"]);
    }

    #[test]
    fn urls_are_pinned_and_arch_parameterized() {
        let downloads = tool_downloads(CloudProvider::K3d);
        let terraform = &downloads[0].1;
        assert!(terraform.starts_with("https://releases.hashicorp.com/terraform/"));
        assert!(terraform.contains(TERRAFORM_VERSION));
        assert!(terraform.ends_with(".zip"));

        let kubectl = &downloads[1].1;
        assert!(kubectl.starts_with("https://dl.k8s.io/release/"));
        assert!(kubectl.contains(KUBECTL_VERSION));
    }

    #[test]
    fn zip_extraction_pulls_the_named_binary() {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            writer
                .start_file("terraform", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"#!/bin/sh\necho terraform\n").unwrap();
            writer.finish().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("terraform");
        extract_zip_binary(&buffer, "terraform", &target).unwrap();
        assert!(std::fs::read_to_string(&target).unwrap().contains("terraform"));
    }
}
