//! Error types for the kubefirst API

use thiserror::Error;

/// Main error type for cluster lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Git repository error
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Outbound HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed client input: missing field, unknown enum, bad body
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation attempted in a state that does not allow it
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A record with the same name already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The named record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Cloud or git provider rejected the request permanently
    #[error("provider error: {0}")]
    Provider(String),

    /// Terraform exited non-zero
    #[error("terraform error: {0}")]
    Terraform(String),

    /// Secret store (Vault) error
    #[error("vault error: {0}")]
    Vault(String),

    /// A bounded wait was exhausted
    #[error("timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a terraform error with the given message
    pub fn terraform(msg: impl Into<String>) -> Self {
        Self::Terraform(msg.into())
    }

    /// Create a vault error with the given message
    pub fn vault(msg: impl Into<String>) -> Self {
        Self::Vault(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the error means "the Kubernetes object was not found"
    ///
    /// Store code treats a 404 from the API server the same as a missing
    /// record, so both shapes are collapsed here.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True when the error means "an object with that name already exists"
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: the HTTP layer and the lifecycle controller categorize errors
    /// differently - client mistakes become 400s, wrong-state calls become
    /// 409s, everything else lands on the cluster record as lastCondition.
    #[test]
    fn story_error_categories_survive_display() {
        let err = Error::validation("cloud_provider must be one of aws, civo, digitalocean, k3d, vultr");
        assert!(err.to_string().contains("validation error"));

        let err = Error::precondition("cannot deploy services to a cluster in \"deleting\" state");
        assert!(err.to_string().contains("precondition failed"));

        let err = Error::terraform("exit status 1: Error acquiring the state lock");
        assert!(err.to_string().contains("terraform error"));

        let err = Error::timeout("argocd application registry never reached Synced/Healthy");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn not_found_matches_kube_404() {
        let api_err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets \"kubefirst-clusters-k1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(Error::Kube(api_err).is_not_found());
        assert!(Error::NotFound("k1".to_string()).is_not_found());
        assert!(!Error::validation("nope").is_not_found());
    }

    #[test]
    fn already_exists_matches_kube_409() {
        let api_err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets \"kubefirst-clusters-k1\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(Error::Kube(api_err).is_already_exists());
        assert!(Error::AlreadyExists("k1".to_string()).is_already_exists());
    }
}
