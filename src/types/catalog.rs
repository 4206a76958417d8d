//! Gitops catalog types
//!
//! The catalog index is pulled from the upstream source repository and the
//! field names mirror its `index.yaml`.

use serde::{Deserialize, Serialize};

/// The parsed catalog index
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GitopsCatalogApps {
    /// Every installable application, in index order
    #[serde(default)]
    pub apps: Vec<GitopsCatalogApp>,
}

/// One installable application bundle
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GitopsCatalogApp {
    /// Directory name in the catalog repository
    pub name: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// Short description shown in the console
    #[serde(default)]
    pub description: String,
    /// Logo image URL
    #[serde(default)]
    pub image_url: String,
    /// Catalog category
    #[serde(default)]
    pub category: String,
    /// Secrets the app needs at install time
    #[serde(default)]
    pub secret_keys: Vec<CatalogAppKey>,
    /// Plain configuration values substituted into the app manifests
    #[serde(default)]
    pub config_keys: Vec<CatalogAppKey>,
}

/// A named secret or config key requested by a catalog app
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogAppKey {
    /// Key name; config keys double as `{{tokenName}}` placeholders
    pub name: String,
    /// Label shown in the console form
    #[serde(default)]
    pub label: String,
    /// Value supplied by the user at install time
    #[serde(default)]
    pub value: String,
    /// Environment variable the value is exposed as, where applicable
    #[serde(default)]
    pub env: String,
}

/// A user-supplied key/value pair at install time
pub type CatalogAppValue = CatalogAppKey;

/// Body of `POST /services/:cluster/:app`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GitopsCatalogAppCreateRequest {
    /// Who requested the installation
    #[serde(default)]
    pub user: String,
    /// Secret values to seed into the secret store
    #[serde(default)]
    pub secret_keys: Vec<CatalogAppKey>,
    /// Config values substituted into the manifests
    #[serde(default)]
    pub config_keys: Vec<CatalogAppKey>,
    /// Render into `templates/` instead of the live registry
    #[serde(default)]
    pub is_template: bool,
    /// Install into a workload cluster's registry subtree
    #[serde(default)]
    pub workload_cluster_name: String,
    /// Environment label for workload-cluster installs
    #[serde(default)]
    pub environment: String,
}

/// Body of `DELETE /services/:cluster/:app`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GitopsCatalogAppDeleteRequest {
    /// Who requested the removal
    #[serde(default)]
    pub user: String,
    /// The app was installed as a template
    #[serde(default)]
    pub is_template: bool,
    /// Remove from a workload cluster's registry subtree
    #[serde(default)]
    pub workload_cluster_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_yaml_parses() {
        let yaml = r#"
apps:
  - name: postgres
    display_name: PostgreSQL
    description: An open source object-relational database
    image_url: https://example.com/postgres.png
    category: Database
    secret_keys:
      - name: POSTGRES_PASSWORD
        label: Admin password
  - name: metabase
    category: Observability
"#;
        let apps: GitopsCatalogApps = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(apps.apps.len(), 2);
        assert_eq!(apps.apps[0].name, "postgres");
        assert_eq!(apps.apps[0].secret_keys[0].name, "POSTGRES_PASSWORD");
        assert!(apps.apps[1].secret_keys.is_empty());
    }
}
