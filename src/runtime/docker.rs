//! Docker Engine backed runtime

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::BuildImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use super::{ContainerRuntime, ContainerSpec, NetworkMember, NetworkSpec, RuntimeError};

impl From<DockerError> for RuntimeError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Request(other.to_string()),
        }
    }
}

/// Runtime talking to the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket)
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<Vec<String>, RuntimeError> {
        let options = BuildImageOptions {
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = Box::pin(self.docker.build_image(options, None, Some(context.into())));
        let mut lines = Vec::new();

        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Request(format!(
                    "image build for {} failed: {}",
                    tag, error
                )));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
        }

        Ok(lines)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            network_mode: spec.network_mode.clone(),
            cap_drop: Some(spec.cap_drop.clone()),
            cap_add: Some(spec.cap_add.clone()),
            privileged: Some(spec.privileged),
            security_opt: Some(spec.security_opt.clone()),
            ..Default::default()
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            user: Some(spec.user.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        for warning in &response.warnings {
            debug!("Container {} created with warning: {}", response.id, warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = Box::pin(
            self.docker
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );

        let mut status = 0;
        while let Some(response) = stream.next().await {
            match response {
                Ok(response) => status = response.status_code,
                // bollard reports a non-zero exit as an error; it is still an exit
                Err(DockerError::DockerContainerWaitError { code, .. }) => status = code,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(status)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = Box::pin(self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        ));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }

        Ok(data)
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = Box::pin(self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));

        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            output.extend_from_slice(&chunk?.into_bytes());
        }

        Ok(output)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            internal: spec.internal,
            ..Default::default()
        };

        self.docker.create_network(options).await?;

        // Network names are unique per session, and every later call accepts the name
        Ok(spec.name.clone())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force,
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(network).await?;
        Ok(())
    }

    async fn inspect_network(&self, network: &str) -> Result<Vec<NetworkMember>, RuntimeError> {
        let info = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;

        let members = info
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(|(container_id, endpoint)| NetworkMember {
                container_id,
                ipv4_address: endpoint.ipv4_address,
            })
            .collect();

        Ok(members)
    }
}
