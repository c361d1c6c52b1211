//! HTTPS client for the guest agent.
//!
//! Each request opens a fresh connection to `{address}:{port}` and trusts
//! only the CA minted for that instance, presenting the instance's leaf
//! certificate as client identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use warmpool_drivers::AGENT_SERVER_NAME;
use warmpool_state::Instance;

use crate::error::{AgentError, AgentResult};

pub const HEALTH_PATH: &str = "/";
pub const SUSPEND_PATH: &str = "/suspend";

/// Calls the orchestrator makes against a VM's guest agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Succeeds once the agent answers 2xx on its health endpoint.
    async fn health(&self, instance: &Instance) -> AgentResult<()>;

    /// Ask the agent to quiesce before the VM is hibernated or stopped.
    async fn suspend(&self, instance: &Instance) -> AgentResult<()>;
}

/// Build a client config pinned to the instance's own CA.
pub fn tls_config(instance: &Instance) -> AgentResult<Arc<rustls::ClientConfig>> {
    let trust = |e: &dyn std::fmt::Display| AgentError::TrustMaterial(e.to_string());

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut instance.ca_cert.as_bytes()) {
        let cert = cert.map_err(|e| trust(&e))?;
        roots.add(cert).map_err(|e| trust(&e))?;
    }
    if roots.is_empty() {
        return Err(AgentError::TrustMaterial(format!(
            "instance {} has no CA certificate",
            instance.id
        )));
    }

    let chain = rustls_pemfile::certs(&mut instance.tls_cert.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| trust(&e))?;
    let key = rustls_pemfile::private_key(&mut instance.tls_key.as_bytes())
        .map_err(|e| trust(&e))?
        .ok_or_else(|| {
            AgentError::TrustMaterial(format!("instance {} has no TLS key", instance.id))
        })?;

    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| trust(&e))?
    .with_root_certificates(roots)
    .with_client_auth_cert(chain, key)
    .map_err(|e| trust(&e))?;

    Ok(Arc::new(config))
}

/// Production [`AgentClient`] over HTTP/1.1 + rustls.
#[derive(Debug, Clone)]
pub struct TlsAgentClient {
    probe_timeout: Duration,
    suspend_timeout: Duration,
}

impl TlsAgentClient {
    pub fn new(probe_timeout: Duration, suspend_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            suspend_timeout,
        }
    }

    async fn request(
        &self,
        instance: &Instance,
        method: Method,
        path: &str,
        timeout: Duration,
    ) -> AgentResult<StatusCode> {
        let config = tls_config(instance)?;
        let address = format!("{}:{}", instance.address, instance.port);

        let exchange = async {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|e| AgentError::Connect {
                    address: address.clone(),
                    message: e.to_string(),
                })?;
            let server_name = ServerName::try_from(AGENT_SERVER_NAME)
                .map_err(|e| AgentError::Handshake(e.to_string()))?;
            let tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|e| AgentError::Handshake(e.to_string()))?;

            let io = TokioIo::new(tls);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| AgentError::Request(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(path)
                .header("host", AGENT_SERVER_NAME)
                .header("user-agent", "warmpool/0.1")
                .body(Empty::<Bytes>::new())
                .map_err(|e| AgentError::Request(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| AgentError::Request(e.to_string()))?;
            Ok(resp.status())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(instance = %instance.id, %path, "agent request timed out");
                Err(AgentError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl AgentClient for TlsAgentClient {
    async fn health(&self, instance: &Instance) -> AgentResult<()> {
        let status = self
            .request(instance, Method::GET, HEALTH_PATH, self.probe_timeout)
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            debug!(instance = %instance.id, %status, "agent health non-2xx");
            Err(AgentError::Status(status.as_u16()))
        }
    }

    async fn suspend(&self, instance: &Instance) -> AgentResult<()> {
        let status = self
            .request(instance, Method::POST, SUSPEND_PATH, self.suspend_timeout)
            .await?;
        if status.is_success() {
            debug!(instance = %instance.id, "agent suspended");
            Ok(())
        } else {
            Err(AgentError::Status(status.as_u16()))
        }
    }
}
