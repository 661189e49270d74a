//! On-disk state.
//!
//! Each cache lives in its own bincode file under the state directory and
//! is loaded independently. A missing or corrupt cache file yields an empty
//! cache; a keypair that exists but cannot be read is fatal, since it anchors
//! every claim the node holds.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use bincode::Options;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::identity::Keypair;

pub const LOCAL_CACHE_FILE: &str = "local.cache";
pub const ANDNA_CACHE_FILE: &str = "andna.cache";
pub const COUNTER_CACHE_FILE: &str = "counter.cache";
pub const RESOLVED_CACHE_FILE: &str = "resolved.cache";
pub const KEYPAIR_FILE: &str = "keypair.key";

/// Upper bound on a state file.
pub const MAX_STATE_FILE_SIZE: u64 = 64 * 1024 * 1024;

fn state_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STATE_FILE_SIZE)
        .with_fixint_encoding()
}

pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no saved state, starting empty");
            return T::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable state file, starting empty");
            return T::default();
        }
    };
    match state_options().deserialize(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state file, starting empty");
            T::default()
        }
    }
}

/// Writes `value` next to `path` and renames it into place.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = state_options()
        .serialize(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Loads the node keypair, generating and saving one on first start.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair> {
    match fs::read(path) {
        Ok(bytes) => {
            let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                bail!("keypair file {} has invalid length {}", path.display(), bytes.len());
            };
            Ok(Keypair::from_secret_key_bytes(&secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            write_atomic(path, &keypair.secret_key_bytes())
                .context("failed to save generated keypair")?;
            info!(public_key = %keypair.public_key(), "generated new keypair");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read keypair {}", path.display())),
    }
}
