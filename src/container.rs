//! Container lifecycle
//!
//! Creates, starts, waits on and removes the server and client containers.
//! Per container: created -> started -> exited; removal is always forced so it is
//! also valid from a running container during teardown.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::config::{env, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::network::NetworkId;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::secret::Secret;

/// Capabilities dropped from every client container
const DROP_ALL_CAPABILITIES: &str = "ALL";

/// Blocks setuid binaries and similar escalation inside client containers
const NO_NEW_PRIVILEGES: &str = "no-new-privileges:true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Server => "server",
            Role::Client => "client",
        };
        write!(f, "{}", s)
    }
}

/// A created container and its role in the session
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHandle {
    id: String,
    role: Role,
    /// Address on the sandbox network, once resolved (server only)
    address: Option<IpAddr>,
}

impl ContainerHandle {
    pub fn new(id: String, role: Role) -> Self {
        Self {
            id,
            role,
            address: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.id.get(..12).unwrap_or(&self.id);
        write!(f, "{} {}", self.role, short)
    }
}

pub struct ContainerManager<R: ContainerRuntime> {
    runtime: Arc<R>,
    config: Arc<SandboxConfig>,
}

impl<R: ContainerRuntime> ContainerManager<R> {
    pub fn new(runtime: Arc<R>, config: Arc<SandboxConfig>) -> Self {
        Self { runtime, config }
    }

    /// Spec for the trusted server: knows every client id and secret, index-aligned
    pub fn server_spec(&self, ids: &[String], secrets: &[Secret]) -> ContainerSpec {
        let secrets: Vec<&str> = secrets.iter().map(Secret::as_str).collect();

        ContainerSpec {
            image: self.config.server_image.clone(),
            cmd: self.config.entry_command.clone(),
            working_dir: self.config.server_drop_dir.clone(),
            user: self.config.server_user.clone(),
            env: vec![
                format!("{}={}", env::SERVER_IDS, ids.join(env::LIST_SEPARATOR)),
                format!(
                    "{}={}",
                    env::SERVER_SECRETS,
                    secrets.join(env::LIST_SEPARATOR)
                ),
            ],
            exposed_ports: vec![self.config.server_port_spec()],
            ..Default::default()
        }
    }

    /// Spec for an untrusted client: no capabilities, only the sandbox network,
    /// and only its own secret
    pub fn client_spec(
        &self,
        network: &NetworkId,
        server_address: IpAddr,
        secret: &Secret,
    ) -> ContainerSpec {
        ContainerSpec {
            image: self.config.client_image.clone(),
            cmd: self.config.entry_command.clone(),
            working_dir: self.config.client_drop_dir.clone(),
            user: self.config.client_user.clone(),
            env: vec![
                format!("{}={}", env::CLIENT_SERVER, server_address),
                format!("{}={}", env::CLIENT_SECRET, secret.as_str()),
            ],
            network_mode: Some(network.as_str().to_string()),
            cap_drop: vec![DROP_ALL_CAPABILITIES.to_string()],
            cap_add: Vec::new(),
            privileged: false,
            security_opt: vec![NO_NEW_PRIVILEGES.to_string()],
            ..Default::default()
        }
    }

    /// Create (but don't start) the server and drop its archive into place
    pub async fn create_server(
        &self,
        ids: &[String],
        secrets: &[Secret],
        archive: &Archive,
    ) -> Result<ContainerHandle> {
        if ids.len() != secrets.len() {
            return Err(SandboxError::InvalidRequest(format!(
                "{} client ids but {} secrets",
                ids.len(),
                secrets.len()
            )));
        }

        info!("Creating server container for {} clients", ids.len());
        let spec = self.server_spec(ids, secrets);
        let handle = self.create(&spec, Role::Server).await?;

        info!("Copying server files ({} files)", archive.len());
        self.upload_or_discard(handle, &self.config.server_drop_dir, archive)
            .await
    }

    /// Create (but don't start) a client attached only to `network`
    pub async fn create_client(
        &self,
        network: &NetworkId,
        server_address: IpAddr,
        secret: &Secret,
        archive: &Archive,
    ) -> Result<ContainerHandle> {
        let spec = self.client_spec(network, server_address, secret);
        let handle = self.create(&spec, Role::Client).await?;

        debug!("Copying client files to {} ({} files)", handle, archive.len());
        self.upload_or_discard(handle, &self.config.client_drop_dir, archive)
            .await
    }

    pub async fn start_server(&self, handle: &ContainerHandle) -> Result<()> {
        info!("Starting {}", handle);
        self.start(handle).await
    }

    pub async fn start_client(&self, handle: &ContainerHandle) -> Result<()> {
        debug!("Starting {}", handle);
        self.start(handle).await
    }

    /// Block until the container exits and return its exit status.
    ///
    /// No timeout here; callers wanting one race this against cancellation.
    pub async fn wait(&self, handle: &ContainerHandle) -> Result<i64> {
        info!("Waiting for {} to stop", handle);
        let status = self
            .runtime
            .wait_container(handle.id())
            .await
            .map_err(|e| SandboxError::runtime(format!("wait for {}", handle), e))?;
        info!("{} stopped with exit code {}", handle, status);
        Ok(status)
    }

    /// Force-remove regardless of run state
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.runtime
            .remove_container(handle.id(), true)
            .await
            .map_err(|e| SandboxError::runtime(format!("remove {}", handle), e))?;
        debug!("Removed {}", handle);
        Ok(())
    }

    /// Combined stdout/stderr, lossily decoded
    pub async fn logs(&self, handle: &ContainerHandle) -> Result<String> {
        let output = self
            .runtime
            .container_logs(handle.id())
            .await
            .map_err(|e| SandboxError::runtime(format!("logs of {}", handle), e))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn create(&self, spec: &ContainerSpec, role: Role) -> Result<ContainerHandle> {
        let id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(|source| SandboxError::ContainerCreation { role, source })?;

        let handle = ContainerHandle::new(id, role);
        debug!("Created {} from image {}", handle, spec.image);
        Ok(handle)
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.runtime
            .start_container(handle.id())
            .await
            .map_err(|e| SandboxError::runtime(format!("start {}", handle), e))
    }

    /// Upload, removing the container if that fails: the caller never sees its handle
    async fn upload_or_discard(
        &self,
        handle: ContainerHandle,
        path: &str,
        archive: &Archive,
    ) -> Result<ContainerHandle> {
        match self.upload(&handle, path, archive).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                if let Err(remove_err) = self.remove(&handle).await {
                    warn!("Failed to remove {} after upload error: {}", handle, remove_err);
                }
                Err(e)
            }
        }
    }

    async fn upload(&self, handle: &ContainerHandle, path: &str, archive: &Archive) -> Result<()> {
        let tar = archive.pack()?;
        self.runtime
            .copy_to_container(handle.id(), path, tar)
            .await
            .map_err(|source| SandboxError::ArchiveUpload {
                container: handle.id().to_string(),
                path: path.to_string(),
                source,
            })
    }
}
