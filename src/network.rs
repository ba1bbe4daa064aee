//! Network lifecycle
//!
//! Every session gets its own internal bridge network. Nothing attached to it can
//! reach anything outside the sandbox.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::container::ContainerHandle;
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerRuntime, NetworkSpec};

/// Per-process counter so sessions created in the same millisecond still differ
static NETWORK_COUNTER: AtomicU64 = AtomicU64::new(0);

const NETWORK_DRIVER: &str = "bridge";

/// Identifier of a session network, as accepted by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build a network name unique to this session
pub fn next_network_name(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let counter = NETWORK_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{}_{}_{}_{}", prefix, millis, std::process::id(), counter)
}

pub struct NetworkManager<R: ContainerRuntime> {
    runtime: Arc<R>,
    prefix: String,
}

impl<R: ContainerRuntime> NetworkManager<R> {
    pub fn new(runtime: Arc<R>, prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            prefix: prefix.into(),
        }
    }

    /// Create an internal bridge network with no external egress
    pub async fn create_isolated_network(&self) -> Result<NetworkId> {
        let spec = NetworkSpec {
            name: next_network_name(&self.prefix),
            driver: NETWORK_DRIVER.to_string(),
            internal: true,
        };

        let id = self
            .runtime
            .create_network(&spec)
            .await
            .map_err(|e| SandboxError::runtime(format!("create network {}", spec.name), e))?;

        info!("Created isolated network {} ({})", spec.name, id);
        Ok(NetworkId::from_name(id))
    }

    /// Connect a container to the network
    pub async fn attach(&self, network: &NetworkId, handle: &ContainerHandle) -> Result<()> {
        debug!("Connecting {} to network {}", handle, network);
        self.runtime
            .connect_network(network.as_str(), handle.id())
            .await
            .map_err(|e| {
                SandboxError::runtime(format!("connect {} to {}", handle.id(), network), e)
            })
    }

    /// Look up the container's address in the network's membership info
    pub async fn resolve_address(
        &self,
        network: &NetworkId,
        handle: &ContainerHandle,
    ) -> Result<IpAddr> {
        let unresolved = |reason: String| SandboxError::AddressResolution {
            network: network.to_string(),
            container: handle.id().to_string(),
            reason,
        };

        let members = self
            .runtime
            .inspect_network(network.as_str())
            .await
            .map_err(|e| SandboxError::runtime(format!("inspect network {}", network), e))?;

        // Members are keyed by the full container id, as returned at creation
        let member = members
            .iter()
            .find(|m| m.container_id == handle.id())
            .ok_or_else(|| unresolved("container is not a member".to_string()))?;

        let cidr = member
            .ipv4_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| unresolved("no address assigned".to_string()))?;

        parse_cidr_address(cidr).map_err(unresolved)
    }

    pub async fn attach_and_resolve_address(
        &self,
        network: &NetworkId,
        handle: &ContainerHandle,
    ) -> Result<IpAddr> {
        self.attach(network, handle).await?;
        let address = self.resolve_address(network, handle).await?;
        info!("{} has address {} on network {}", handle, address, network);
        Ok(address)
    }

    /// Force-disconnect every container, continuing past failures.
    ///
    /// Returns the first error once every disconnect has been attempted.
    pub async fn detach_all(&self, network: &NetworkId, handles: &[ContainerHandle]) -> Result<()> {
        let mut first_error = None;

        for handle in handles {
            if let Err(e) = self
                .runtime
                .disconnect_network(network.as_str(), handle.id(), true)
                .await
            {
                warn!("Failed to disconnect {} from {}: {}", handle, network, e);
                first_error.get_or_insert(SandboxError::runtime(
                    format!("disconnect {} from {}", handle.id(), network),
                    e,
                ));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove the network. Failures are logged only: by now every container is gone
    /// and a leftover network is harmless.
    pub async fn remove_network(&self, network: &NetworkId) {
        match self.runtime.remove_network(network.as_str()).await {
            Ok(()) => info!("Removed network {}", network),
            Err(e) => warn!("Failed to remove network {}: {}", network, e),
        }
    }
}

/// `172.18.0.2/16` -> `172.18.0.2`
fn parse_cidr_address(cidr: &str) -> std::result::Result<IpAddr, String> {
    let address = cidr.split('/').next().unwrap_or(cidr).trim();
    address
        .parse::<IpAddr>()
        .map_err(|e| format!("invalid address {:?}: {}", cidr, e))
}
