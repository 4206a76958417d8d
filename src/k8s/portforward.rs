//! Scoped pod port-forwards
//!
//! Several lifecycle steps talk to in-cluster services (Argo CD, Vault)
//! before any ingress exists. Each tunnel is scoped to its step: dropping
//! the guard aborts the forwarder task, so an early return or panic in the
//! step can never leak a background tunnel.

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::Result;

/// A live local-port tunnel to a pod; closed on drop
pub struct PortForwardGuard {
    accept_task: tokio::task::JoinHandle<()>,
    local_port: u16,
}

impl PortForwardGuard {
    /// Local port the tunnel listens on
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local base URL of the tunnel
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }
}

impl Drop for PortForwardGuard {
    fn drop(&mut self) {
        self.accept_task.abort();
        debug!(port = self.local_port, "port-forward released");
    }
}

/// Forward `127.0.0.1:<local_port>` to `<pod>:<remote_port>`
///
/// Each accepted connection opens its own portforward stream through the
/// API server and bridges the two byte streams until either side closes.
pub async fn forward_pod_port(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<PortForwardGuard> {
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!(
            "binding local port {local_port}: {e}"
        ))))?;

    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pod_name.to_string();
    info!(namespace = %namespace, pod = %pod, local_port, remote_port, "port-forward opened");

    let accept_task = tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "port-forward accept failed");
                    break;
                }
            };
            let api = api.clone();
            let pod = pod.clone();
            tokio::spawn(async move {
                match api.portforward(&pod, &[remote_port]).await {
                    Ok(mut forwarder) => {
                        let Some(mut upstream) = forwarder.take_stream(remote_port) else {
                            warn!(pod = %pod, remote_port, "no stream on port-forward");
                            return;
                        };
                        match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
                            Ok((sent, received)) => {
                                debug!(sent, received, "port-forward connection closed")
                            }
                            Err(e) => debug!(error = %e, "port-forward bridge error"),
                        }
                    }
                    Err(e) => warn!(pod = %pod, error = %e, "port-forward failed"),
                }
            });
        }
    });

    Ok(PortForwardGuard {
        accept_task,
        local_port,
    })
}
