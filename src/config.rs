//! Sandbox configuration
//!
//! Fixed contract between the orchestrator and the programs running inside the sandbox
//! (drop paths, log file names, environment variable names), plus the tunable settings
//! loaded from the environment.

use std::path::PathBuf;

use tracing::warn;

/// Raw random bytes per client secret (before encoding)
pub const SECRET_LENGTH: usize = 64;

/// Environment variable names injected into containers
pub mod env {
    /// Server: client ids, joined by `LIST_SEPARATOR`
    pub const SERVER_IDS: &str = "BOTBOX_IDS";

    /// Server: client secrets, index-aligned with `SERVER_IDS`
    pub const SERVER_SECRETS: &str = "BOTBOX_SECRETS";

    /// Client: address of the server on the sandbox network
    pub const CLIENT_SERVER: &str = "BOTBOX_SERVER";

    /// Client: this client's own secret
    pub const CLIENT_SECRET: &str = "BOTBOX_SECRET";

    pub const LIST_SEPARATOR: &str = " ";
}

/// Log files the server writes into its drop directory
pub mod files {
    /// One JSON object per game tick
    pub const STATE_LOG: &str = "state.log";

    /// JSON array of per-client scores
    pub const RESULT_LOG: &str = "result.log";

    /// Client ids the server acknowledged
    pub const CONNECT_LOG: &str = "connect.log";

    /// Client ids the server flagged as misbehaving
    pub const DISCONNECT_LOG: &str = "disconnect.log";
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image the server container runs (default: botbox-sandbox-server)
    pub server_image: String,
    /// Image every client container runs (default: botbox-sandbox-client)
    pub client_image: String,
    /// Unprivileged account the server runs as
    pub server_user: String,
    /// Unprivileged account clients run as
    pub client_user: String,
    /// Working directory of the server; its archive and logs live here
    pub server_drop_dir: String,
    /// Working directory of a client; its archive lives here
    pub client_drop_dir: String,
    /// Entry command for both roles, run from the drop directory
    pub entry_command: Vec<String>,
    /// Port the server listens on for the game protocol
    pub server_port: u16,
    /// Prefix for per-session network names
    pub network_prefix: String,
    /// Docker build context for the server image (None: image is prebuilt)
    pub server_build_context: Option<PathBuf>,
    /// Docker build context for the client image (None: image is prebuilt)
    pub client_build_context: Option<PathBuf>,
    /// Maximum server output kept in the session outcome, in characters
    pub output_preview_chars: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            server_image: "botbox-sandbox-server".to_string(),
            client_image: "botbox-sandbox-client".to_string(),
            server_user: "sandbox".to_string(),
            client_user: "sandbox".to_string(),
            server_drop_dir: "/botbox-server".to_string(),
            client_drop_dir: "/botbox-client".to_string(),
            entry_command: vec!["/bin/bash".to_string(), "run.sh".to_string()],
            server_port: 12345,
            network_prefix: "sandbox".to_string(),
            server_build_context: None,
            client_build_context: None,
            output_preview_chars: 4096,
        }
    }
}

impl SandboxConfig {
    /// Load configuration, overriding defaults with `SANDBOX_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SANDBOX_SERVER_IMAGE") {
            config.server_image = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_CLIENT_IMAGE") {
            config.client_image = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_SERVER_USER") {
            config.server_user = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_CLIENT_USER") {
            config.client_user = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_NETWORK_PREFIX") {
            config.network_prefix = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_SERVER_PORT") {
            match v.parse::<u16>() {
                Ok(port) => config.server_port = port,
                Err(e) => warn!("Ignoring invalid SANDBOX_SERVER_PORT={}: {}", v, e),
            }
        }
        config.server_build_context = std::env::var("SANDBOX_SERVER_BUILD_CONTEXT")
            .ok()
            .map(PathBuf::from);
        config.client_build_context = std::env::var("SANDBOX_CLIENT_BUILD_CONTEXT")
            .ok()
            .map(PathBuf::from);

        config
    }

    /// Full path of a log file inside the server's drop directory
    pub fn server_file(&self, name: &str) -> String {
        format!("{}/{}", self.server_drop_dir.trim_end_matches('/'), name)
    }

    /// Port spec in the runtime's `<port>/tcp` form
    pub fn server_port_spec(&self) -> String {
        format!("{}/tcp", self.server_port)
    }
}
