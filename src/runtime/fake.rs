//! In-memory runtime for tests
//!
//! Containers get ids `c0`, `c1`, ... in creation order. Every call is recorded so tests
//! can assert on ordering, and failures can be injected per call index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, NetworkMember, NetworkSpec, RuntimeError};
use crate::archive::Archive;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BuildImage(String),
    CreateContainer(String),
    StartContainer(String),
    RemoveContainer(String),
    Wait(String),
    CopyTo(String, String),
    CopyFrom(String, String),
    Logs(String),
    CreateNetwork(String),
    Connect(String, String),
    Disconnect(String, String),
    RemoveNetwork(String),
    InspectNetwork(String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub uploads: Vec<(String, Archive)>,
    pub started: bool,
    pub removed: bool,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, NetworkSpec>,
    /// network -> container ids explicitly connected
    connections: HashMap<String, Vec<String>>,
    created: usize,
}

/// Failure injection knobs, all keyed by container creation index
#[derive(Default)]
pub struct FakeBehavior {
    pub fail_create_at: Option<usize>,
    pub fail_upload_at: Option<usize>,
    pub fail_start_at: Option<usize>,
    pub fail_remove_at: HashSet<usize>,
    pub fail_disconnect: bool,
    pub fail_network_create: bool,
    pub fail_network_remove: bool,
    pub fail_build: bool,
    /// Report members without an address
    pub omit_addresses: bool,
    /// `wait_container` never returns
    pub block_wait: bool,
    pub exit_code: i64,
    /// Files served by `copy_from_container`, keyed by base name
    pub server_files: HashMap<String, Vec<u8>>,
    pub server_output: Vec<u8>,
}

pub struct FakeRuntime {
    behavior: FakeBehavior,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Runtime whose server leaves the given log files behind
    pub fn with_server_files(files: &[(&str, &str)]) -> Self {
        let server_files = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
            .collect();
        Self::new(FakeBehavior {
            server_files,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn networks(&self) -> Vec<NetworkSpec> {
        self.state.lock().unwrap().networks.values().cloned().collect()
    }

    /// Networks a container was explicitly connected to after creation
    pub fn connected_networks(&self, id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .connections
            .iter()
            .filter(|(_, ids)| ids.iter().any(|c| c == id))
            .map(|(net, _)| net.clone())
            .collect()
    }

    /// Position of the first call equal to `call`
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn index_of(id: &str) -> usize {
        id.trim_start_matches('c').parse().unwrap_or(usize::MAX)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<Vec<String>, RuntimeError> {
        self.record(Call::BuildImage(tag.to_string()));
        if self.behavior.fail_build {
            return Err(RuntimeError::Request("build failed".into()));
        }
        let files = Archive::unpack(&context)
            .map_err(|e| RuntimeError::Request(e.to_string()))?;
        Ok(vec![format!("Step 1/1 : {} files", files.len())])
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let index = state.created;
        state.created += 1;
        state.calls.push(Call::CreateContainer(spec.image.clone()));

        if self.behavior.fail_create_at == Some(index) {
            return Err(RuntimeError::Request("create refused".into()));
        }

        let id = format!("c{}", index);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                uploads: Vec::new(),
                started: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::StartContainer(id.to_string()));

        if self.behavior.fail_start_at == Some(Self::index_of(id)) {
            return Err(RuntimeError::Request("start refused".into()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.started = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::RemoveContainer(id.to_string()));

        if self.behavior.fail_remove_at.contains(&Self::index_of(id)) {
            return Err(RuntimeError::Request("container is stuck".into()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.removed = true;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        self.record(Call::Wait(id.to_string()));
        if self.behavior.block_wait {
            futures::future::pending::<()>().await;
        }
        Ok(self.behavior.exit_code)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::CopyTo(id.to_string(), path.to_string()));

        if self.behavior.fail_upload_at == Some(Self::index_of(id)) {
            return Err(RuntimeError::Request("no space left on device".into()));
        }
        let files = Archive::unpack(&archive).map_err(|e| RuntimeError::Request(e.to_string()))?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.uploads.push((path.to_string(), files));
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.record(Call::CopyFrom(id.to_string(), path.to_string()));

        let name = path.rsplit('/').next().unwrap_or(path);
        let content = self
            .behavior
            .server_files
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(path.to_string()))?;

        let mut archive = Archive::new();
        archive.insert(name, content.clone());
        archive
            .pack()
            .map_err(|e| RuntimeError::Request(e.to_string()))
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        self.record(Call::Logs(id.to_string()));
        Ok(self.behavior.server_output.clone())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateNetwork(spec.name.clone()));

        if self.behavior.fail_network_create {
            return Err(RuntimeError::Request("daemon unreachable".into()));
        }
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::Connect(network.to_string(), container.to_string()));

        if !state.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(network.to_string()));
        }
        state
            .connections
            .entry(network.to_string())
            .or_default()
            .push(container.to_string());
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        self.record(Call::Disconnect(network.to_string(), container.to_string()));
        if self.behavior.fail_disconnect {
            return Err(RuntimeError::Request("endpoint busy".into()));
        }
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::RemoveNetwork(network.to_string()));

        if self.behavior.fail_network_remove {
            return Err(RuntimeError::Request("network has active endpoints".into()));
        }
        state.networks.remove(network);
        Ok(())
    }

    async fn inspect_network(&self, network: &str) -> Result<Vec<NetworkMember>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::InspectNetwork(network.to_string()));

        let connected = state.connections.get(network).cloned().unwrap_or_default();
        let members = state
            .containers
            .iter()
            .filter(|(id, c)| {
                c.started
                    && (connected.contains(id) || c.spec.network_mode.as_deref() == Some(network))
            })
            .map(|(id, _)| NetworkMember {
                container_id: id.clone(),
                ipv4_address: if self.behavior.omit_addresses {
                    Some(String::new())
                } else {
                    Some(format!("172.30.0.{}/16", Self::index_of(id) + 2))
                },
            })
            .collect();
        Ok(members)
    }
}
