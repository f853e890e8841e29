//! Node configuration.
//!
//! One `config.toml` per node carries every knob the host supplies:
//! stores, chunking, the gossip mesh, anti-entropy cadences and the
//! validator roster. Typed accessors convert the raw entries into the
//! forms the subsystems consume.

use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{bail, Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use snapmesh_crypto::{ChunkKey, ValidatorSigner};
use snapmesh_gossip::GossipConfig;
use snapmesh_ledger::{ValidatorInfo, ValidatorSet};
use snapmesh_primitives::NodeId;
use snapmesh_sync::AntiEntropyConfig;

pub const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_CHUNK_SIZE_BYTES: usize = snapmesh_chunkstore::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct FabricConfig {
    pub node_id: NodeId,

    pub chunkstore: ChunkStoreConfig,

    pub catalog: CatalogStoreConfig,

    pub gossip: GossipConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ChunkStoreConfig {
    pub path: Utf8PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// 32 bytes, hex encoded. Absent means chunks are stored in the
    /// clear.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl ChunkStoreConfig {
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            encryption_key: None,
        }
    }

    pub fn chunk_key(&self) -> EyreResult<Option<ChunkKey>> {
        let Some(encoded) = &self.encryption_key else {
            return Ok(None);
        };

        let bytes = hex::decode(encoded).wrap_err("encryption_key is not valid hex")?;
        let key: [u8; 32] = match bytes.try_into() {
            Ok(key) => key,
            Err(bytes) => bail!("encryption_key must be 32 bytes, got {}", bytes.len()),
        };

        Ok(Some(ChunkKey::new(key)))
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct CatalogStoreConfig {
    pub path: Utf8PathBuf,
}

impl CatalogStoreConfig {
    #[must_use]
    pub const fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct SyncConfig {
    #[serde(rename = "gossip_interval_ms", with = "serde_duration")]
    pub gossip_interval: Duration,

    #[serde(rename = "anti_entropy_interval_ms", with = "serde_duration")]
    pub anti_entropy_interval: Duration,

    #[serde(rename = "round_timeout_ms", with = "serde_duration")]
    pub round_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gossip_interval: snapmesh_sync::DEFAULT_GOSSIP_INTERVAL,
            anti_entropy_interval: snapmesh_sync::DEFAULT_ANTI_ENTROPY_INTERVAL,
            round_timeout: snapmesh_sync::DEFAULT_ROUND_TIMEOUT,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn engine_config(&self) -> AntiEntropyConfig {
        let mut config = AntiEntropyConfig::default();
        config.gossip_interval = self.gossip_interval;
        config.anti_entropy_interval = self.anti_entropy_interval;
        config.round_timeout = self.round_timeout;
        config
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct LedgerConfig {
    pub path: Utf8PathBuf,

    pub self_validator_id: NodeId,

    /// 32 bytes, hex encoded.
    pub self_private_key: String,

    #[serde(
        rename = "block_timeout_ms",
        with = "serde_duration",
        default = "default_block_timeout"
    )]
    pub block_timeout: Duration,

    #[serde(default = "default_tx_pool_max")]
    pub tx_pool_max: usize,

    /// The fixed validator roster `{id, pubkey}`. Kept last: arrays of
    /// tables close out the section in the serialized file.
    pub validators: Vec<ValidatorInfo>,
}

impl LedgerConfig {
    pub fn validator_set(&self) -> EyreResult<ValidatorSet> {
        ValidatorSet::new(self.validators.clone()).wrap_err("invalid validator roster")
    }

    pub fn signer(&self) -> EyreResult<ValidatorSigner> {
        let bytes = hex::decode(&self.self_private_key)
            .wrap_err("self_private_key is not valid hex")?;
        let key: [u8; 32] = match bytes.try_into() {
            Ok(key) => key,
            Err(bytes) => bail!("self_private_key must be 32 bytes, got {}", bytes.len()),
        };

        Ok(ValidatorSigner::new(key))
    }
}

impl FabricConfig {
    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE_BYTES
}

const fn default_block_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_tx_pool_max() -> usize {
    4096
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    fn sample(dir: &Utf8Path) -> FabricConfig {
        let signer = ValidatorSigner::random(&mut thread_rng());

        FabricConfig {
            node_id: NodeId::new("node-0").unwrap(),
            chunkstore: ChunkStoreConfig {
                encryption_key: Some(hex::encode([7u8; 32])),
                ..ChunkStoreConfig::new(dir.join("chunks"))
            },
            catalog: CatalogStoreConfig::new(dir.join("catalog")),
            gossip: GossipConfig::new(
                "127.0.0.1:4820".parse().unwrap(),
                vec!["127.0.0.1:4821".parse().unwrap()],
            ),
            sync: SyncConfig::default(),
            ledger: LedgerConfig {
                path: dir.join("ledger"),
                self_validator_id: NodeId::new("node-0").unwrap(),
                self_private_key: hex::encode([9u8; 32]),
                block_timeout: Duration::from_secs(30),
                tx_pool_max: 4096,
                validators: vec![ValidatorInfo {
                    id: NodeId::new("node-0").unwrap(),
                    public_key: signer.public_key(),
                }],
            },
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let config = sample(&path);
        config.save(&path).unwrap();
        assert!(FabricConfig::exists(&path));

        let loaded = FabricConfig::load(&path).unwrap();

        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.chunkstore.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert_eq!(loaded.gossip.fanout, config.gossip.fanout);
        assert_eq!(loaded.sync.gossip_interval, Duration::from_millis(200));
        assert_eq!(loaded.ledger.tx_pool_max, 4096);
        assert!(loaded.chunkstore.chunk_key().unwrap().is_some());
        assert!(loaded.ledger.validator_set().is_ok());
        assert!(loaded.ledger.signer().is_ok());
    }

    #[test]
    fn missing_directory_fails_to_load() {
        let missing = Utf8PathBuf::from("/definitely/not/here");
        assert!(FabricConfig::load(&missing).is_err());
    }

    #[test]
    fn malformed_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut config = sample(&path);
        config.chunkstore.encryption_key = Some("abc123".to_owned());
        assert!(config.chunkstore.chunk_key().is_err());

        config.ledger.self_private_key = "not-hex".to_owned();
        assert!(config.ledger.signer().is_err());
    }

    #[test]
    fn durations_serialize_as_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let config = sample(&path);
        let toml = toml::to_string_pretty(&config).unwrap();

        assert!(toml.contains("anti_entropy_interval_ms = 15000"));
        assert!(toml.contains("heartbeat_interval_ms = 1000"));
        assert!(toml.contains("block_timeout_ms = 30000"));
    }
}
