//! Result extraction
//!
//! Pulls the server's log files out of its drop directory after the game and parses
//! them into typed results. The server is trusted to write them, but nothing here
//! panics on malformed content: every parse failure comes back as `ResultParse`.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::archive::Archive;
use crate::config::{files, SandboxConfig};
use crate::container::ContainerHandle;
use crate::error::{Result, SandboxError};
use crate::runtime::ContainerRuntime;

pub type ClientId = String;

/// Per-client integer scores, index-aligned with the setup order
pub type GameResult = Vec<i64>;

/// Clients as reported by the server after the run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientRoster {
    /// Clients the server acknowledged
    pub connected: Vec<ClientId>,
    /// Clients the server flagged (disconnected, cheated, broke protocol)
    pub misbehaving: Vec<ClientId>,
}

pub struct ResultExtractor<R: ContainerRuntime> {
    runtime: Arc<R>,
    config: Arc<SandboxConfig>,
}

impl<R: ContainerRuntime> ResultExtractor<R> {
    pub fn new(runtime: Arc<R>, config: Arc<SandboxConfig>) -> Self {
        Self { runtime, config }
    }

    /// Fetch one file from the server's drop directory.
    ///
    /// The runtime hands back a single-file tar archive, not raw bytes.
    pub async fn fetch_file(&self, handle: &ContainerHandle, name: &str) -> Result<Vec<u8>> {
        let path = self.config.server_file(name);
        let data = self
            .runtime
            .copy_from_container(handle.id(), &path)
            .await
            .map_err(|e| SandboxError::runtime(format!("copy {} from {}", path, handle), e))?;

        let archive = Archive::unpack(&data)?;
        debug!("Fetched {} from {} ({} entries)", path, handle, archive.len());

        let single = archive.len() == 1;
        archive
            .into_files()
            .find(|(entry, _)| single || Path::new(entry).file_name() == Some(OsStr::new(name)))
            .map(|(_, content)| content)
            .ok_or_else(|| SandboxError::MalformedArchive(format!("{} not in archive", name)))
    }

    pub async fn connected_clients(&self, handle: &ContainerHandle) -> Result<Vec<ClientId>> {
        let contents = self.fetch_file(handle, files::CONNECT_LOG).await?;
        Ok(parse_client_list(&contents))
    }

    pub async fn misbehaving_clients(&self, handle: &ContainerHandle) -> Result<Vec<ClientId>> {
        let contents = self.fetch_file(handle, files::DISCONNECT_LOG).await?;
        Ok(parse_misbehaving_list(&contents))
    }

    pub async fn client_roster(&self, handle: &ContainerHandle) -> Result<ClientRoster> {
        Ok(ClientRoster {
            connected: self.connected_clients(handle).await?,
            misbehaving: self.misbehaving_clients(handle).await?,
        })
    }

    pub async fn game_result(&self, handle: &ContainerHandle) -> Result<GameResult> {
        let contents = self.fetch_file(handle, files::RESULT_LOG).await?;
        parse_game_result(&contents)
    }

    pub async fn state_history(&self, handle: &ContainerHandle) -> Result<StateHistory> {
        let contents = self.fetch_file(handle, files::STATE_LOG).await?;
        Ok(StateHistory::from_bytes(contents))
    }
}

/// One id per line; trailing blank lines are trimmed, internal ones kept
pub fn parse_client_list(contents: &[u8]) -> Vec<ClientId> {
    let text = String::from_utf8_lossy(contents);
    let text = text.trim_end();
    if text.is_empty() {
        return Vec::new();
    }
    text.lines().map(|line| line.to_string()).collect()
}

/// One id per line; blank lines anywhere are dropped
pub fn parse_misbehaving_list(contents: &[u8]) -> Vec<ClientId> {
    String::from_utf8_lossy(contents)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// JSON array of numbers, each truncated toward zero
pub fn parse_game_result(contents: &[u8]) -> Result<GameResult> {
    let scores: Vec<f64> = serde_json::from_slice(contents)
        .map_err(|e| SandboxError::parse(files::RESULT_LOG, None, e))?;
    Ok(scores.into_iter().map(|s| s.trunc() as i64).collect())
}

/// Lazily parsed game states, one JSON value per line of `state.log`.
///
/// Each line is parsed only when reached; a bad line yields an error at its
/// position and iteration carries on with the next one. Not restartable: to read
/// the history again, fetch the log again.
pub struct StateHistory {
    contents: Vec<u8>,
    offset: usize,
    line: usize,
}

impl StateHistory {
    pub fn from_bytes(contents: Vec<u8>) -> Self {
        Self {
            contents,
            offset: 0,
            line: 0,
        }
    }
}

impl Iterator for StateHistory {
    type Item = Result<serde_json::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.contents.len() {
            let rest = &self.contents[self.offset..];
            let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
            let raw = &rest[..end];
            self.offset += end + 1;
            self.line += 1;

            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Some(
                serde_json::from_slice(raw)
                    .map_err(|e| SandboxError::parse(files::STATE_LOG, Some(self.line), e)),
            );
        }
        None
    }
}
