//! Game Sandbox
//!
//! Runs one trusted game server and N untrusted client programs, each in its own
//! container, on a private network with no route out. Clients authenticate to the
//! server with per-session secrets; results are read back from the server's log files
//! once it exits, and every container and the network are destroyed afterwards.

pub mod archive;
pub mod config;
pub mod container;
pub mod error;
pub mod manifest;
pub mod network;
pub mod orchestrator;
pub mod results;
pub mod runtime;
pub mod secret;

pub use archive::Archive;
pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use orchestrator::{ClientEntry, Sandbox, SandboxOutcome, SandboxRequest};
pub use runtime::{ContainerRuntime, DockerRuntime};
