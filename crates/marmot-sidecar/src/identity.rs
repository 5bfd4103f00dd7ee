//! Identity file and engine storage for the sidecar process

use std::path::Path;

use anyhow::{Context, Result};
use marmot_group::{GroupConfig, MarmotEngine};
use marmot_memory_storage::MarmotMemoryStorage;
use marmot_sqlite_storage::MarmotSqliteStorage;
use nostr::Keys;
use serde::{Deserialize, Serialize};

/// SQLite database file name inside the state dir
pub const DATABASE_FILE: &str = "marmot.sqlite";

/// Default identity file name inside the state dir
pub const IDENTITY_FILE: &str = "identity.json";

/// Identity as stored on disk
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityFile {
    /// Secret key (hex)
    pub secret_key_hex: String,
    /// Public key (hex), for humans
    pub public_key_hex: String,
}

/// Load the identity at `identity_path`, creating it on first run
pub fn load_or_create_keys(identity_path: &Path) -> Result<Keys> {
    if let Ok(raw) = std::fs::read_to_string(identity_path) {
        let f: IdentityFile = serde_json::from_str(&raw).context("parse identity json")?;
        let keys = Keys::parse(&f.secret_key_hex).context("parse secret key hex")?;
        return Ok(keys);
    }

    let keys = Keys::generate();
    let f = IdentityFile {
        secret_key_hex: keys.secret_key().to_secret_hex(),
        public_key_hex: keys.public_key().to_hex(),
    };

    if let Some(parent) = identity_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(
        identity_path,
        format!("{}\n", serde_json::to_string_pretty(&f)?),
    )
    .context("write identity json")?;
    tracing::info!(target: "marmot_sidecar::identity", pubkey = %keys.public_key(), "Created identity");
    Ok(keys)
}

/// Engine over the SQLite database in `state_dir`
pub fn open_sqlite_engine(
    state_dir: &Path,
    keys: Keys,
    config: GroupConfig,
) -> Result<MarmotEngine<MarmotSqliteStorage>> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("create dir {}", state_dir.display()))?;
    let db_path = state_dir.join(DATABASE_FILE);
    let storage = MarmotSqliteStorage::new(&db_path)
        .with_context(|| format!("open sqlite: {}", db_path.display()))?;
    Ok(MarmotEngine::builder(keys, storage).with_config(config).build())
}

/// Engine whose state ends with the process
pub fn open_memory_engine(keys: Keys, config: GroupConfig) -> MarmotEngine<MarmotMemoryStorage> {
    MarmotEngine::builder(keys, MarmotMemoryStorage::new())
        .with_config(config)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(IDENTITY_FILE);

        let first = load_or_create_keys(&path).unwrap();
        let second = load_or_create_keys(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let raw = std::fs::read_to_string(&path).unwrap();
        let file: IdentityFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.public_key_hex, first.public_key().to_hex());
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        std::fs::write(&path, "{").unwrap();
        assert!(load_or_create_keys(&path).is_err());
    }

    #[test]
    fn test_sqlite_engine_keeps_groups() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Keys::generate();

        let engine = open_sqlite_engine(dir.path(), keys.clone(), GroupConfig::default()).unwrap();
        let group = engine.create_group().unwrap();
        drop(engine);

        let engine = open_sqlite_engine(dir.path(), keys, GroupConfig::default()).unwrap();
        assert_eq!(engine.get_group(&group.group_id).unwrap().epoch, 0);
    }
}
