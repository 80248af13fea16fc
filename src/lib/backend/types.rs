use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// One container as shown in the dashboard listing.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub name: String,
    pub status: String,
    pub ipv4: String,
    pub memory: u64,
    pub disk: u64,
    pub cpu_time: String,
    pub os: String,
    pub release: String,
    pub architecture: String,
}

/// A proxy device forwarding a host port into a container.
#[derive(Debug, Clone, Serialize)]
pub struct PortRedirect {
    pub container: String,
    pub device_name: String,
    pub listen: String,
    pub connect: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerListing {
    pub containers: Vec<ContainerSummary>,
    pub redirections: Vec<PortRedirect>,
}

/// Distro name mapped to its available releases, newest first.
pub type ImageCatalog = BTreeMap<String, Vec<String>>;

/// Image to launch, e.g. images:debian/12.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub distro: String,
    pub version: String,
}

impl ImageRef {
    pub fn remote_spec(&self) -> String {
        format!("images:{}/{}", self.distro, self.version)
    }
}

/// Initial account provisioned inside a freshly created container.
#[derive(Debug, Clone)]
pub struct UserSpec {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("unexpected output from {command}: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("container {0} did not obtain an ipv4 address in time")]
    NoAddress(String),
}

/// Boundary to the external container manager. Every call is potentially
/// slow and potentially failing; implementations must bound their own
/// waiting so a stuck call cannot pin a per-container lock forever.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create a container from `image`, wait for it to come up, and
    /// provision `user` inside it when given.
    async fn launch(
        &self,
        image: &ImageRef,
        name: &str,
        user: Option<&UserSpec>,
    ) -> Result<(), BackendError>;

    async fn start(&self, name: &str) -> Result<(), BackendError>;

    async fn stop(&self, name: &str) -> Result<(), BackendError>;

    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    async fn list(&self) -> Result<ContainerListing, BackendError>;

    async fn list_images(&self) -> Result<ImageCatalog, BackendError>;

    /// Returns the name of the proxy device that was added.
    async fn add_port_forward(
        &self,
        name: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<String, BackendError>;

    async fn remove_port_forward(&self, name: &str, device_name: &str) -> Result<(), BackendError>;
}
