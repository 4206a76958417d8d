//! Record flattening for the Secret data map
//!
//! A record serializes to a JSON object; each top-level key becomes a Secret
//! data key. String values are stored raw so the operator can read them with
//! `kubectl get secret -o jsonpath`; everything else is stored as JSON text.
//! A raw string that itself parses as JSON (e.g. an all-digit cluster id)
//! would be ambiguous on the way back in, so those are stored JSON-quoted.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::store::SecretData;
use crate::Result;

/// Flatten a record into Secret data
pub fn flatten<T: Serialize>(record: &T) -> Result<SecretData> {
    let value = serde_json::to_value(record)?;
    let Value::Object(fields) = value else {
        return Err(Error::serialization(
            "record did not serialize to a JSON object",
        ));
    };

    let mut data = SecretData::new();
    for (key, value) in fields {
        let bytes = match value {
            Value::String(s) => {
                if serde_json::from_str::<Value>(&s).is_ok() {
                    // ambiguous raw string, keep it quoted
                    serde_json::to_string(&s)?.into_bytes()
                } else {
                    s.into_bytes()
                }
            }
            other => other.to_string().into_bytes(),
        };
        data.insert(key, bytes);
    }
    Ok(data)
}

/// Re-inflate Secret data into a typed record
pub fn inflate<T: DeserializeOwned>(data: SecretData) -> Result<T> {
    let mut fields = serde_json::Map::new();
    for (key, bytes) in data {
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::serialization(format!("secret key {key} is not utf-8: {e}")))?;
        let value = match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        };
        fields.insert(key, value);
    }
    Ok(serde_json::from_value(Value::Object(fields))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloudProvider, Cluster, ClusterStatus};

    #[test]
    fn cluster_record_round_trips() {
        let mut cluster = Cluster {
            cluster_name: "k1".to_string(),
            cluster_id: "x9f2ab".to_string(),
            cloud_provider: CloudProvider::Digitalocean,
            domain_name: "kubefirst.dev".to_string(),
            status: ClusterStatus::Provisioning,
            in_progress: true,
            ..Cluster::default()
        };
        cluster.checks.install_tools_check = true;
        cluster.git_auth.owner = "acme".to_string();
        cluster.git_auth.token = "ghp_secret".to_string();

        let data = flatten(&cluster).unwrap();
        // scalars readable in place, sub-objects as JSON text
        assert_eq!(data["clusterName"], b"k1");
        assert_eq!(data["installToolsCheck"], b"true");
        assert!(String::from_utf8_lossy(&data["gitAuth"]).contains("\"owner\":\"acme\""));

        let back: Cluster = inflate(data).unwrap();
        assert_eq!(back.cluster_name, "k1");
        assert_eq!(back.git_auth.token, "ghp_secret");
        assert!(back.checks.install_tools_check);
        assert!(back.in_progress);
    }

    /// Story: a random cluster id can be all digits. Stored raw it would
    /// re-inflate as a JSON number and fail typed deserialization, so
    /// ambiguous strings are stored quoted.
    #[test]
    fn numeric_looking_strings_survive() {
        let cluster = Cluster {
            cluster_name: "true".to_string(),
            cluster_id: "123456".to_string(),
            ..Cluster::default()
        };
        let data = flatten(&cluster).unwrap();
        assert_eq!(data["clusterID"], b"\"123456\"");
        assert_eq!(data["clusterName"], b"\"true\"");

        let back: Cluster = inflate(data).unwrap();
        assert_eq!(back.cluster_id, "123456");
        assert_eq!(back.cluster_name, "true");
    }

    #[test]
    fn empty_strings_survive() {
        let cluster = Cluster::default();
        let data = flatten(&cluster).unwrap();
        assert_eq!(data["lastCondition"], b"");
        let back: Cluster = inflate(data).unwrap();
        assert_eq!(back.last_condition, "");
    }
}
