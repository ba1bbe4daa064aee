use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use game_sandbox::manifest::load_request;
use game_sandbox::{DockerRuntime, Sandbox, SandboxConfig};

const DEFAULT_MANIFEST: &str = "./session.toml";

/// Overall limit on a session's wait for the server; unset means no limit
const WAIT_TIMEOUT_ENV: &str = "SANDBOX_WAIT_TIMEOUT_SECS";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("game_sandbox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let manifest_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SANDBOX_MANIFEST").ok())
        .unwrap_or_else(|| DEFAULT_MANIFEST.into())
        .into();
    let request = load_request(&manifest_path)?;

    let config = SandboxConfig::from_env();
    info!(
        "Sandbox images: server={}, client={}",
        config.server_image, config.client_image
    );

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let sandbox = Sandbox::new(Arc::new(runtime), config);

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(cancel.clone(), wait_timeout());

    let outcome = sandbox.run(&request, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(())
}

fn wait_timeout() -> Option<Duration> {
    let raw = std::env::var(WAIT_TIMEOUT_ENV).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!("Ignoring invalid {}={:?}", WAIT_TIMEOUT_ENV, raw);
            None
        }
    }
}

/// Cancel the session on Ctrl-C or once the timeout elapses
fn spawn_cancel_triggers(cancel: CancellationToken, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, tearing down sandbox"),
            _ = deadline => warn!("Session timed out, tearing down sandbox"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
}
