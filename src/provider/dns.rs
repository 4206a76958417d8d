//! DNS propagation checks
//!
//! Domain ownership is proven by creating a TXT record through the
//! provider's DNS API and polling until it is publicly resolvable. Lookups
//! go through two independent DNS-over-HTTPS JSON endpoints - the second is
//! the configured backup resolver - so a single resolver outage cannot fail
//! a liveness test.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Error;
use crate::Result;

/// Value every provider writes into the liveness TXT record
pub const LIVENESS_RECORD_VALUE: &str = "domain record propagated";

/// Propagation poll: 100 attempts x 10s
const PROPAGATION_ATTEMPTS: u32 = 100;
const PROPAGATION_INTERVAL: Duration = Duration::from_secs(10);

const PRIMARY_RESOLVER: &str = "https://dns.google/resolve";
const BACKUP_RESOLVER: &str = "https://cloudflare-dns.com/dns-query";

/// Name of the liveness record inside a zone
pub fn liveness_record_name(domain: &str) -> String {
    format!("kubefirst-liveness.{domain}")
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: String,
}

async fn lookup_txt(client: &reqwest::Client, resolver: &str, name: &str) -> Result<Vec<String>> {
    let response = client
        .get(resolver)
        .query(&[("name", name), ("type", "TXT")])
        .header("accept", "application/dns-json")
        .send()
        .await?
        .error_for_status()?
        .json::<DohResponse>()
        .await?;

    Ok(response
        .answer
        .into_iter()
        .map(|a| a.data.trim_matches('"').to_string())
        .collect())
}

/// True once either resolver returns the expected TXT value for `name`
async fn is_propagated(client: &reqwest::Client, name: &str, expected: &str) -> bool {
    for resolver in [PRIMARY_RESOLVER, BACKUP_RESOLVER] {
        match lookup_txt(client, resolver, name).await {
            Ok(values) if values.iter().any(|v| v == expected) => return true,
            Ok(_) => debug!(resolver, name, "record not visible yet"),
            Err(e) => debug!(resolver, name, error = %e, "txt lookup failed"),
        }
    }
    false
}

/// Poll until the liveness TXT record is publicly visible
///
/// Bounded at 100 x 10s (~17 minutes); exhaustion is a timeout.
pub async fn wait_for_txt_propagation(domain: &str, expected: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let name = liveness_record_name(domain);

    for attempt in 1..=PROPAGATION_ATTEMPTS {
        if is_propagated(&client, &name, expected).await {
            info!(domain = %domain, attempt, "domain liveness record propagated");
            return Ok(());
        }
        debug!(domain = %domain, attempt, "waiting for TXT propagation");
        tokio::time::sleep(PROPAGATION_INTERVAL).await;
    }

    Err(Error::timeout(format!(
        "TXT record {name} did not propagate after {PROPAGATION_ATTEMPTS} attempts"
    )))
}
