//! Archive codec
//!
//! Converts a named-file collection to and from the tar stream that container runtimes
//! accept for copy-in and return from copy-out. Knows nothing about sandboxes.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, SandboxError};

/// Files to drop into (or retrieved from) a container, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    files: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), content.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|c| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Consume the archive, yielding its entries
    pub fn into_files(self) -> impl Iterator<Item = (String, Vec<u8>)> {
        self.files.into_iter()
    }

    /// Load every regular file under `root`, named by its path relative to `root`
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut archive = Archive::new();
        collect_dir(root, root, &mut archive)?;
        Ok(archive)
    }

    /// Pack into a tar stream, one entry per file
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        for (name, content) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);

            builder
                .append_data(&mut header, name, content.as_slice())
                .map_err(|e| {
                    SandboxError::MalformedArchive(format!("cannot add entry {}: {}", name, e))
                })?;
        }

        builder
            .into_inner()
            .map_err(|e| SandboxError::MalformedArchive(e.to_string()))
    }

    /// Parse a tar stream; directory entries are skipped
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let malformed = |e: std::io::Error| SandboxError::MalformedArchive(e.to_string());

        let mut tar = tar::Archive::new(data);
        let mut archive = Archive::new();

        for entry in tar.entries().map_err(malformed)? {
            let mut entry = entry.map_err(malformed)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = entry
                .path()
                .map_err(malformed)?
                .to_string_lossy()
                .into_owned();
            let declared = entry.size();

            // Header sizes are untrusted; don't preallocate more than 1MB
            let mut content = Vec::with_capacity(declared.min(1 << 20) as usize);
            entry.read_to_end(&mut content).map_err(malformed)?;

            if content.len() as u64 != declared {
                return Err(SandboxError::MalformedArchive(format!(
                    "entry {} declares {} bytes but holds {}",
                    name,
                    declared,
                    content.len()
                )));
            }

            archive.files.insert(name, content);
        }

        Ok(archive)
    }
}

impl FromIterator<(String, Vec<u8>)> for Archive {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

fn collect_dir(root: &Path, dir: &Path, archive: &mut Archive) -> Result<()> {
    let io_err = |e: std::io::Error| {
        SandboxError::MalformedArchive(format!("cannot read {}: {}", dir.display(), e))
    };

    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        // Does not follow symlinks
        let file_type = entry.file_type().map_err(io_err)?;

        // A link could point anywhere on the host
        if file_type.is_symlink() {
            return Err(SandboxError::MalformedArchive(format!(
                "refusing symlink {}",
                path.display()
            )));
        }

        if file_type.is_dir() {
            collect_dir(root, &path, archive)?;
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let content = std::fs::read(&path).map_err(io_err)?;
        archive.insert(name, content);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Archive {
        let mut archive = Archive::new();
        archive.insert("run.sh", "#!/bin/bash\npython3 bot.py\n");
        archive.insert("bot.py", "print('hello')\n");
        archive.insert("lib/util.py", vec![0u8, 159, 146, 150]);
        archive.insert("empty.txt", Vec::new());
        archive
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let archive = sample();
        let packed = archive.pack().unwrap();
        assert_eq!(Archive::unpack(&packed).unwrap(), archive);
    }

    #[test]
    fn test_empty_archive_round_trip() {
        let packed = Archive::new().pack().unwrap();
        assert!(Archive::unpack(&packed).unwrap().is_empty());
    }

    #[test]
    fn test_unpack_truncated_content() {
        let mut archive = Archive::new();
        archive.insert("big.bin", vec![7u8; 4096]);
        let packed = archive.pack().unwrap();

        // Header block plus part of the content
        let truncated = &packed[..512 + 1000];
        assert!(matches!(
            Archive::unpack(truncated),
            Err(SandboxError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_unpack_corrupted_header() {
        let mut packed = sample().pack().unwrap();
        // Clobber the size field of the first header; the checksum no longer matches
        for b in &mut packed[124..136] {
            *b = b'9';
        }
        assert!(matches!(
            Archive::unpack(&packed),
            Err(SandboxError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_pack_rejects_parent_paths() {
        let mut archive = Archive::new();
        archive.insert("../escape.sh", "rm -rf /");
        assert!(matches!(
            archive.pack(),
            Err(SandboxError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_from_dir_nested() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo hi").unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data").join("map.txt"), "###").unwrap();

        let archive = Archive::from_dir(dir.path()).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.get("run.sh"), Some(&b"echo hi"[..]));
        assert_eq!(archive.get("data/map.txt"), Some(&b"###"[..]));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_dir_rejects_symlinks() {
        let host = tempfile::tempdir().unwrap();
        let secret = host.path().join("host_secret");
        std::fs::write(&secret, "HOST-ONLY").unwrap();

        let bot = tempfile::tempdir().unwrap();
        std::fs::write(bot.path().join("run.sh"), "cat loot").unwrap();
        std::os::unix::fs::symlink(&secret, bot.path().join("loot")).unwrap();

        assert!(matches!(
            Archive::from_dir(bot.path()),
            Err(SandboxError::MalformedArchive(_))
        ));

        // Linked directories are refused too
        let nested = tempfile::tempdir().unwrap();
        std::fs::create_dir(nested.path().join("data")).unwrap();
        std::os::unix::fs::symlink(host.path(), nested.path().join("data").join("host")).unwrap();
        assert!(matches!(
            Archive::from_dir(nested.path()),
            Err(SandboxError::MalformedArchive(_))
        ));
    }
}
