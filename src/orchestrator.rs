//! Sandbox orchestrator
//!
//! Sequences one game session:
//! build images -> network -> server -> server start + address -> clients -> client
//! starts -> wait for server exit -> extract results -> destroy.
//!
//! Every resource created along the way is recorded in a `Ledger` that is threaded
//! through the stages, and `destroy_sandbox` runs on every exit path (success,
//! setup failure, cancellation).

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::Archive;
use crate::config::SandboxConfig;
use crate::container::{ContainerHandle, ContainerManager};
use crate::error::{Result, SandboxError};
use crate::network::{NetworkId, NetworkManager};
use crate::results::{ClientId, ClientRoster, GameResult, ResultExtractor};
use crate::runtime::ContainerRuntime;
use crate::secret::{generate_secrets, Secret};

/// One client's code, in setup order
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub id: ClientId,
    pub archive: Archive,
}

/// Everything needed to run one session
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub server: Archive,
    pub clients: Vec<ClientEntry>,
}

impl SandboxRequest {
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.id.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        validate_client_ids(self.clients.iter().map(|c| c.id.as_str()))
    }
}

/// Ids travel space-separated in the server's environment, so they must be
/// non-empty, whitespace-free and unique
pub fn validate_client_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid client id {:?}",
                id
            )));
        }
        if !seen.insert(id) {
            return Err(SandboxError::InvalidRequest(format!(
                "duplicate client id {:?}",
                id
            )));
        }
    }
    Ok(())
}

/// Report of a completed session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SandboxOutcome {
    pub network: String,
    pub server_exit_code: i64,
    pub roster: ClientRoster,
    /// Index-aligned with `SandboxRequest::clients`
    pub scores: GameResult,
    pub history: Vec<serde_json::Value>,
    /// First characters of the server's stdout/stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,
    /// Extraction and teardown failures; results above may be partial
    pub errors: Vec<String>,
}

/// Resources created so far in a session, in creation order
#[derive(Debug, Default)]
pub struct Ledger {
    network: Option<NetworkId>,
    containers: Vec<ContainerHandle>,
    /// Containers connected to the network, to disconnect before removal
    attached: Vec<ContainerHandle>,
}

impl Ledger {
    pub fn network(&self) -> Option<&NetworkId> {
        self.network.as_ref()
    }

    pub fn containers(&self) -> &[ContainerHandle] {
        &self.containers
    }
}

pub struct Sandbox<R: ContainerRuntime> {
    runtime: Arc<R>,
    config: Arc<SandboxConfig>,
    networks: NetworkManager<R>,
    containers: ContainerManager<R>,
    extractor: ResultExtractor<R>,
}

impl<R: ContainerRuntime> Sandbox<R> {
    pub fn new(runtime: Arc<R>, config: SandboxConfig) -> Self {
        let config = Arc::new(config);
        Self {
            networks: NetworkManager::new(runtime.clone(), config.network_prefix.clone()),
            containers: ContainerManager::new(runtime.clone(), config.clone()),
            extractor: ResultExtractor::new(runtime.clone(), config.clone()),
            runtime,
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one session to completion.
    ///
    /// Cancelling `cancel` aborts setup or the wait for the server; teardown still
    /// runs before `Cancelled` is returned.
    pub async fn run(
        &self,
        request: &SandboxRequest,
        cancel: CancellationToken,
    ) -> Result<SandboxOutcome> {
        request.validate()?;
        let secrets = generate_secrets(request.clients.len())?;
        self.build_images().await?;

        let mut ledger = Ledger::default();
        let result = self.execute(request, &secrets, &mut ledger, &cancel).await;
        let teardown = self.destroy_sandbox(&ledger).await;

        match result {
            Ok(mut outcome) => {
                if let Err(e) = teardown {
                    warn!("Sandbox teardown incomplete: {}", e);
                    outcome.errors.push(e.to_string());
                }
                info!(
                    "Session on {} finished: exit_code={}, connected={}, scores={:?}",
                    outcome.network,
                    outcome.server_exit_code,
                    outcome.roster.connected.len(),
                    outcome.scores
                );
                Ok(outcome)
            }
            Err(e) => {
                error!("Sandbox session failed: {}", e);
                if let Err(teardown_err) = teardown {
                    warn!("Sandbox teardown after failure incomplete: {}", teardown_err);
                }
                Err(e)
            }
        }
    }

    /// Build the server and client images from their configured build contexts.
    /// Images without a build context are assumed to exist already.
    pub async fn build_images(&self) -> Result<()> {
        let targets = [
            (&self.config.server_build_context, &self.config.server_image),
            (&self.config.client_build_context, &self.config.client_image),
        ];

        for (context, tag) in targets {
            if let Some(context) = context {
                self.build_image(context, tag).await?;
            }
        }
        Ok(())
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<()> {
        info!("Building image {} from {}", tag, context.display());
        let tar = Archive::from_dir(context)?.pack()?;

        let lines = self
            .runtime
            .build_image(tar, tag)
            .await
            .map_err(|e| SandboxError::runtime(format!("build image {}", tag), e))?;

        for line in &lines {
            debug!("[build {}] {}", tag, line);
        }
        info!("Built image {}", tag);
        Ok(())
    }

    async fn execute(
        &self,
        request: &SandboxRequest,
        secrets: &[Secret],
        ledger: &mut Ledger,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome> {
        let network = self.setup_network(ledger, cancel).await?;
        let server = self
            .setup_server(request, secrets, &network, ledger, cancel)
            .await?;
        let address = server
            .address()
            .ok_or_else(|| SandboxError::AddressResolution {
                network: network.to_string(),
                container: server.id().to_string(),
                reason: "server address missing after start".to_string(),
            })?;

        let clients = self
            .setup_clients(request, secrets, &network, address, ledger, cancel)
            .await?;
        self.start_clients(&clients, cancel).await?;

        let server_exit_code = tokio::select! {
            status = self.containers.wait(&server) => status?,
            _ = cancel.cancelled() => {
                warn!("Cancelled while waiting for {}", server);
                return Err(SandboxError::Cancelled);
            }
        };

        Ok(self.collect(&network, &server, server_exit_code).await)
    }

    async fn setup_network(
        &self,
        ledger: &mut Ledger,
        cancel: &CancellationToken,
    ) -> Result<NetworkId> {
        check_cancelled(cancel)?;
        let network = self.networks.create_isolated_network().await?;
        ledger.network = Some(network.clone());
        Ok(network)
    }

    /// Create and start the server, then resolve its address on the network
    async fn setup_server(
        &self,
        request: &SandboxRequest,
        secrets: &[Secret],
        network: &NetworkId,
        ledger: &mut Ledger,
        cancel: &CancellationToken,
    ) -> Result<ContainerHandle> {
        check_cancelled(cancel)?;
        let server = self
            .containers
            .create_server(&request.client_ids(), secrets, &request.server)
            .await?;
        ledger.containers.push(server.clone());

        self.containers.start_server(&server).await?;

        check_cancelled(cancel)?;
        ledger.attached.push(server.clone());
        let address = self
            .networks
            .attach_and_resolve_address(network, &server)
            .await?;

        Ok(server.with_address(address))
    }

    /// Create every client in index order; `secrets[i]` goes with `clients[i]`
    async fn setup_clients(
        &self,
        request: &SandboxRequest,
        secrets: &[Secret],
        network: &NetworkId,
        server_address: IpAddr,
        ledger: &mut Ledger,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerHandle>> {
        let mut clients = Vec::with_capacity(request.clients.len());

        for (index, (client, secret)) in request.clients.iter().zip(secrets).enumerate() {
            check_cancelled(cancel)?;
            debug!("Setting up client {} ({})", index, client.id);

            let handle = self
                .containers
                .create_client(network, server_address, secret, &client.archive)
                .await
                .inspect_err(|e| error!("Client {} ({}) setup failed: {}", index, client.id, e))?;

            // Created with network_mode set, so it is already attached
            ledger.containers.push(handle.clone());
            ledger.attached.push(handle.clone());
            clients.push(handle);
        }

        info!("Created {} client containers", clients.len());
        Ok(clients)
    }

    async fn start_clients(
        &self,
        clients: &[ContainerHandle],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for client in clients {
            check_cancelled(cancel)?;
            self.containers.start_client(client).await?;
        }
        info!("Started {} clients", clients.len());
        Ok(())
    }

    /// Pull results out of the exited server. Failures are recorded next to the
    /// partial results rather than aborting the collection.
    async fn collect(
        &self,
        network: &NetworkId,
        server: &ContainerHandle,
        server_exit_code: i64,
    ) -> SandboxOutcome {
        let mut outcome = SandboxOutcome {
            network: network.to_string(),
            server_exit_code,
            ..Default::default()
        };

        let mut record = |e: SandboxError| {
            warn!("Result extraction: {}", e);
            outcome.errors.push(e.to_string());
        };

        let connected = self.extractor.connected_clients(server).await;
        let misbehaving = self.extractor.misbehaving_clients(server).await;
        let scores = self.extractor.game_result(server).await;
        let history = self.extractor.state_history(server).await;
        let output = self.containers.logs(server).await;

        let mut roster = ClientRoster::default();
        match connected {
            Ok(ids) => roster.connected = ids,
            Err(e) => record(e),
        }
        match misbehaving {
            Ok(ids) => roster.misbehaving = ids,
            Err(e) => record(e),
        }
        let scores = scores.unwrap_or_else(|e| {
            record(e);
            Vec::new()
        });

        let mut states = Vec::new();
        match history {
            Ok(history) => {
                for state in history {
                    match state {
                        Ok(state) => states.push(state),
                        Err(e) => record(e),
                    }
                }
            }
            Err(e) => record(e),
        }

        let preview = match output {
            Ok(output) if !output.is_empty() => {
                Some(output.chars().take(self.config.output_preview_chars).collect())
            }
            Ok(_) => None,
            Err(e) => {
                record(e);
                None
            }
        };

        outcome.roster = roster;
        outcome.scores = scores;
        outcome.history = states;
        outcome.server_output = preview;
        outcome
    }

    /// Disconnect and force-remove every container, then remove the network.
    ///
    /// Keeps going past individual failures and returns the first container error;
    /// network removal is always attempted and never fails the teardown.
    pub async fn destroy_sandbox(&self, ledger: &Ledger) -> Result<()> {
        info!(
            "Destroying sandbox ({} containers)",
            ledger.containers.len()
        );
        let mut first_error = None;

        if let Some(network) = &ledger.network {
            if let Err(e) = self.networks.detach_all(network, &ledger.attached).await {
                first_error = Some(e);
            }
        }

        for handle in &ledger.containers {
            if let Err(e) = self.containers.remove(handle).await {
                warn!("Failed to remove {}: {}", handle, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(network) = &ledger.network {
            self.networks.remove_network(network).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SandboxError::Cancelled)
    } else {
        Ok(())
    }
}
