//! Sibling-container bootstrap for the document store
//!
//! Starts the store as a container next to the engine when no external
//! instance is configured: create with a bind-mounted data directory and a
//! bound host port, start, poll `/health-check` until ready, and tear down
//! on shutdown. Talks to the local container daemon's HTTP API.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::GraphQlClient;
use crate::error::StoreError;

/// Configuration for the store container
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container daemon endpoint, e.g. http://localhost:2375
    pub daemon_url: String,
    /// Image to run
    pub image: String,
    /// Container name (stable so restarts reuse it)
    pub name: String,
    /// Host directory bind-mounted as the store's data dir
    pub data_dir: PathBuf,
    /// Host port bound to the store's API port
    pub host_port: u16,
    /// Store API port inside the container
    pub container_port: u16,
    /// How long to poll for readiness
    pub ready_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            daemon_url: "http://localhost:2375".to_string(),
            image: "sourcenetwork/defradb:latest".to_string(),
            name: "shelf-store".to_string(),
            data_dir: PathBuf::from("./data"),
            host_port: 9181,
            container_port: 9181,
            ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Handle to a running store container
pub struct StoreContainer {
    config: ContainerConfig,
    http: reqwest::Client,
    container_id: Option<String>,
}

impl StoreContainer {
    pub fn new(config: ContainerConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            config,
            http,
            container_id: None,
        })
    }

    /// Store API base URL on the host side
    pub fn store_url(&self) -> String {
        format!("http://localhost:{}", self.config.host_port)
    }

    /// Create and start the container, then wait for the store to answer
    /// its health check.
    pub async fn start(&mut self) -> Result<(), StoreError> {
        let create_url = format!(
            "{}/containers/create?name={}",
            self.config.daemon_url, self.config.name
        );
        let port_key = format!("{}/tcp", self.config.container_port);
        let body = json!({
            "Image": self.config.image,
            "ExposedPorts": { &port_key: {} },
            "HostConfig": {
                "Binds": [format!("{}:/data", self.config.data_dir.display())],
                "PortBindings": {
                    &port_key: [{ "HostPort": self.config.host_port.to_string() }]
                },
            },
        });

        let response = self.http.post(&create_url).json(&body).send().await?;
        let status = response.status().as_u16();
        // 409 means a container with this name exists; reuse it
        if !response.status().is_success() && status != 409 {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, message });
        }

        let container_id = if status == 409 {
            self.config.name.clone()
        } else {
            let created: serde_json::Value = response.json().await?;
            created["Id"]
                .as_str()
                .ok_or_else(|| StoreError::Malformed("container create returned no Id".to_string()))?
                .to_string()
        };

        let start_url = format!("{}/containers/{}/start", self.config.daemon_url, container_id);
        let response = self.http.post(&start_url).send().await?;
        let status = response.status().as_u16();
        // 304 means already started
        if !response.status().is_success() && status != 304 {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, message });
        }

        info!(container = %container_id, port = self.config.host_port, "Store container started");
        self.container_id = Some(container_id);

        self.wait_ready().await
    }

    /// Poll the store health check until it answers or the deadline passes
    async fn wait_ready(&self) -> Result<(), StoreError> {
        let client = GraphQlClient::new(self.store_url(), Duration::from_secs(5))?;
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;

        loop {
            match client.health_check().await {
                Ok(()) => {
                    info!("Store container is healthy");
                    return Ok(());
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(StoreError::Unhealthy(format!(
                        "store did not become ready within {:?}: {e}",
                        self.config.ready_timeout
                    )));
                }
                Err(e) => {
                    debug!(error = %e, "Store not ready yet");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// Fetch recent container logs (diagnostics on failed startup)
    pub async fn logs(&self, tail: usize) -> Result<String, StoreError> {
        let Some(id) = &self.container_id else {
            return Ok(String::new());
        };
        let url = format!(
            "{}/containers/{}/logs?stdout=true&stderr=true&tail={}",
            self.config.daemon_url, id, tail
        );
        let response = self.http.get(&url).send().await?;
        Ok(response.text().await.unwrap_or_default())
    }

    /// Stop and remove the container
    pub async fn stop(&mut self) -> Result<(), StoreError> {
        let Some(id) = self.container_id.take() else {
            return Ok(());
        };

        let stop_url = format!("{}/containers/{}/stop", self.config.daemon_url, id);
        if let Err(e) = self.http.post(&stop_url).send().await {
            warn!(error = %e, "Failed to stop store container");
        }

        let remove_url = format!("{}/containers/{}?v=false", self.config.daemon_url, id);
        if let Err(e) = self.http.delete(&remove_url).send().await {
            warn!(error = %e, "Failed to remove store container");
        }

        info!(container = %id, "Store container stopped");
        Ok(())
    }
}
