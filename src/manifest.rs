//! Session manifest
//!
//! TOML file naming the server directory and each client's id and directory.
//! Relative paths are resolved against the manifest's own directory.
//!
//! ```toml
//! server = "./server"
//!
//! [[clients]]
//! id = "alice"
//! path = "./bots/alice"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::archive::Archive;
use crate::orchestrator::{validate_client_ids, ClientEntry, SandboxRequest};

#[derive(Debug, Deserialize)]
pub struct SessionManifest {
    pub server: PathBuf,
    #[serde(default)]
    pub clients: Vec<ClientManifest>,
}

#[derive(Debug, Deserialize)]
pub struct ClientManifest {
    pub id: String,
    pub path: PathBuf,
}

impl SessionManifest {
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: SessionManifest =
            toml::from_str(content).context("Failed to parse session manifest")?;

        validate_client_ids(manifest.clients.iter().map(|c| c.id.as_str()))?;
        Ok(manifest)
    }

    /// Read every referenced directory into an archive
    pub fn into_request(self, base: &Path) -> Result<SandboxRequest> {
        let server_dir = base.join(&self.server);
        let server = Archive::from_dir(&server_dir)
            .with_context(|| format!("Failed to read server directory {}", server_dir.display()))?;

        let clients = self
            .clients
            .into_iter()
            .map(|client| {
                let dir = base.join(&client.path);
                let archive = Archive::from_dir(&dir).with_context(|| {
                    format!("Failed to read client {} directory {}", client.id, dir.display())
                })?;
                Ok(ClientEntry {
                    id: client.id,
                    archive,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SandboxRequest { server, clients })
    }
}

/// Load a manifest file and the directories it names
pub fn load_request(path: &Path) -> Result<SandboxRequest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let manifest = SessionManifest::parse(&content)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let request = manifest.into_request(base)?;
    info!(
        "Loaded session manifest {} ({} clients)",
        path.display(),
        request.clients.len()
    );
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_request() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "server/run.sh", "python3 server.py");
        write(dir.path(), "server/server.py", "print('hi')");
        write(dir.path(), "bots/alice/run.sh", "./alice");
        write(dir.path(), "bots/bob/run.sh", "./bob");
        write(
            dir.path(),
            "session.toml",
            r#"
server = "server"

[[clients]]
id = "alice"
path = "bots/alice"

[[clients]]
id = "bob"
path = "bots/bob"
"#,
        );

        let request = assert_ok!(load_request(&dir.path().join("session.toml")));
        assert_eq!(request.server.len(), 2);
        assert_eq!(request.client_ids(), vec!["alice", "bob"]);
        assert_eq!(
            request.clients[1].archive.get("run.sh"),
            Some(&b"./bob"[..])
        );
    }

    #[test]
    fn test_rejects_bad_ids() {
        let duplicate = r#"
server = "s"
[[clients]]
id = "a"
path = "x"
[[clients]]
id = "a"
path = "y"
"#;
        assert_err!(SessionManifest::parse(duplicate));

        let spaced = r#"
server = "s"
[[clients]]
id = "a b"
path = "x"
"#;
        assert_err!(SessionManifest::parse(spaced));
    }

    #[test]
    fn test_missing_client_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "server/run.sh", "true");
        let manifest = assert_ok!(SessionManifest::parse(
            "server = \"server\"\n[[clients]]\nid = \"a\"\npath = \"nowhere\"\n"
        ));

        let err = assert_err!(manifest.into_request(dir.path()));
        assert!(err.to_string().contains("client a"));
    }

    #[cfg(unix)]
    #[test]
    fn test_client_symlink_is_refused() {
        let host = tempfile::tempdir().unwrap();
        write(host.path(), "host_secret", "HOST-ONLY");

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "server/run.sh", "true");
        write(dir.path(), "bot/run.sh", "cat loot");
        std::os::unix::fs::symlink(host.path().join("host_secret"), dir.path().join("bot/loot"))
            .unwrap();
        write(
            dir.path(),
            "session.toml",
            "server = \"server\"\n[[clients]]\nid = \"a\"\npath = \"bot\"\n",
        );

        assert_err!(load_request(&dir.path().join("session.toml")));
    }

    #[test]
    fn test_no_clients() {
        let manifest = assert_ok!(SessionManifest::parse("server = \"server\"\n"));
        assert!(manifest.clients.is_empty());
    }
}
