//! S3-compatible object store operations
//!
//! Civo, DigitalOcean Spaces, Vultr, Akamai, and the local minio all speak
//! the S3 API; this wrapper carries the endpoint + static credentials each
//! provider minted and handles bucket lifecycle for the terraform state
//! store.

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use tracing::info;

use crate::error::Error;
use crate::Result;

/// One S3-compatible endpoint with fixed credentials
pub struct ObjectStore {
    client: Client,
}

impl ObjectStore {
    /// Build a client for a provider endpoint
    pub fn new(endpoint: &str, region: &str, access_key: &str, secret_key: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "kubefirst");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
        }
    }

    /// Create a bucket; an existing bucket with the name is fine
    pub async fn create_bucket(&self, name: &str) -> Result<()> {
        match self.client.create_bucket().bucket(name).send().await {
            Ok(_) => {
                info!(bucket = %name, "state store bucket created");
                Ok(())
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_bucket_already_owned_by_you() {
                    info!(bucket = %name, "state store bucket already exists");
                    Ok(())
                } else {
                    Err(Error::provider(format!(
                        "creating bucket {name}: {service_err}"
                    )))
                }
            }
        }
    }

    /// Delete a bucket and everything in it; a missing bucket is success
    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        // a bucket must be empty before deletion
        loop {
            let listing = match self
                .client
                .list_objects_v2()
                .bucket(name)
                .send()
                .await
            {
                Ok(listing) => listing,
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_bucket() {
                        return Ok(());
                    }
                    return Err(Error::provider(format!("listing bucket {name}: {service_err}")));
                }
            };

            let keys: Vec<String> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key().map(String::from))
                .collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                self.client
                    .delete_object()
                    .bucket(name)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        Error::provider(format!("deleting object {key} in {name}: {e}"))
                    })?;
            }
        }

        self.client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| Error::provider(format!("deleting bucket {name}: {e}")))?;
        info!(bucket = %name, "state store bucket deleted");
        Ok(())
    }
}
