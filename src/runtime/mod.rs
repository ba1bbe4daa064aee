//! Container runtime capability
//!
//! The engine never talks to a container daemon directly. Everything it needs
//! (containers, networks, filesystem copy, image builds) goes through `ContainerRuntime`:
//! - `DockerRuntime`: the Docker Engine API via bollard
//! - `FakeRuntime` (tests only): in-memory double recording every call
//!
//! Implementations report raw failures as `RuntimeError`; the managers decide
//! which `SandboxError` kind a failure becomes.

pub mod docker;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon rejected or failed the request
    #[error("runtime request failed: {0}")]
    Request(String),

    /// The referenced container or network does not exist
    #[error("no such object: {0}")]
    NotFound(String),
}

/// Runtime-neutral container creation config
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub user: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    /// `<port>/<proto>` entries
    pub exposed_ports: Vec<String>,
    /// Network the container is attached to at creation (None: runtime default)
    pub network_mode: Option<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub privileged: bool,
    pub security_opt: Vec<String>,
}

impl ContainerSpec {
    /// Value of an environment variable in `env`, if set
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    /// No route to anything outside the network
    pub internal: bool,
}

/// One container's membership in a network, as reported by inspection
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMember {
    pub container_id: String,
    /// CIDR form, e.g. `172.18.0.2/16`; empty or None if unassigned
    pub ipv4_address: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a tar build context; returns the build log lines
    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<Vec<String>, RuntimeError>;

    /// Create (but don't start) a container; returns its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Block until the container exits; returns its exit status
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Extract a tar stream into `path` inside the container
    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError>;

    /// Fetch `path` from the container as a tar stream
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Combined stdout/stderr of the container
    async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Create a network; returns its id
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError>;

    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError>;

    async fn inspect_network(&self, network: &str) -> Result<Vec<NetworkMember>, RuntimeError>;
}
