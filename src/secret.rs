//! Per-client authentication secrets

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::SECRET_LENGTH;
use crate::error::{Result, SandboxError};

/// Opaque, base64url-encoded random token handed to exactly one client
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep secrets out of logs
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted>)")
    }
}

/// Generate `n` independent secrets from the OS random source.
///
/// There is no retry: if the entropy source fails the caller must abort sandbox creation.
pub fn generate_secrets(n: usize) -> Result<Vec<Secret>> {
    let mut rng = OsRng;
    let mut secrets = Vec::with_capacity(n);

    for _ in 0..n {
        let mut bytes = [0u8; SECRET_LENGTH];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| SandboxError::RandomSource(e.to_string()))?;
        secrets.push(Secret(URL_SAFE_NO_PAD.encode(bytes)));
    }

    Ok(secrets)
}
