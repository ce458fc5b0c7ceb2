//! Node and Session Configuration
//!
//! Read once at dial or listen time. The file form is JSON with hex-encoded
//! key material; every field has a default so an empty object is a valid
//! configuration (with a freshly generated identity).

use crate::crypto::StaticKeys;
use crate::message::{Capability, Hello, Status, ETH_PROTOCOL_VERSION};
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Ethereum mainnet genesis block hash, the default chain anchor.
pub const MAINNET_GENESIS: [u8; 32] = [
    0xd4, 0xe5, 0x67, 0x40, 0xf8, 0x76, 0xae, 0xf8, 0xc0, 0x10, 0xb8, 0x6a, 0x40, 0xd5, 0xf5,
    0x67, 0x45, 0xa1, 0x18, 0xd0, 0x90, 0x6a, 0x34, 0xe6, 0x9a, 0xec, 0x8c, 0x0d, 0xb1, 0xcb,
    0x8f, 0xa3,
];

/// Difficulty of the mainnet genesis block.
pub const MAINNET_GENESIS_DIFFICULTY: u128 = 17_179_869_184;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn default_client_id() -> String {
    concat!("rlpx-session/v", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_p2p_version() -> u64 {
    5
}

fn default_capabilities() -> Vec<CapabilityConfig> {
    vec![CapabilityConfig { name: "eth".into(), version: ETH_PROTOCOL_VERSION }]
}

fn default_network_id() -> u64 {
    1
}

fn default_total_difficulty() -> u128 {
    MAINNET_GENESIS_DIFFICULTY
}

/// A capability entry in the file form.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
    pub name: String,
    pub version: u64,
}

/// File-form node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte static secret key. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_p2p_version")]
    pub p2p_version: u64,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<CapabilityConfig>,

    /// Port advertised in `Hello`; zero when we do not accept inbound dials.
    #[serde(default)]
    pub listen_port: u16,

    #[serde(default = "default_network_id")]
    pub network_id: u64,

    /// Hex-encoded genesis hash; defaults to mainnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,

    /// Hex-encoded best block hash; defaults to the genesis hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_hash: Option<String>,

    #[serde(default = "default_total_difficulty")]
    pub total_difficulty: u128,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            client_id: default_client_id(),
            p2p_version: default_p2p_version(),
            capabilities: default_capabilities(),
            listen_port: 0,
            network_id: default_network_id(),
            genesis_hash: None,
            head_hash: None,
            total_difficulty: default_total_difficulty(),
        }
    }
}

fn parse_hash(field: &'static str, value: &str) -> Result<[u8; 32], ConfigError> {
    let raw = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| ConfigError::InvalidField { field, reason: e.to_string() })?;
    raw.try_into()
        .map_err(|_| ConfigError::InvalidField { field, reason: "expected 32 bytes".into() })
}

impl NodeConfig {
    /// Load the file form from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Resolve key material and hashes into a ready-to-use session
    /// configuration.
    pub fn into_session_config(self) -> Result<SessionConfig, ConfigError> {
        let keys = match &self.secret_key {
            Some(hex_key) => {
                let raw = hex::decode(hex_key.trim_start_matches("0x")).map_err(|e| {
                    ConfigError::InvalidField { field: "secret_key", reason: e.to_string() }
                })?;
                StaticKeys::from_secret_slice(&raw).map_err(|e| ConfigError::InvalidField {
                    field: "secret_key",
                    reason: e.to_string(),
                })?
            }
            None => StaticKeys::generate(),
        };

        let genesis_hash = match &self.genesis_hash {
            Some(value) => parse_hash("genesis_hash", value)?,
            None => MAINNET_GENESIS,
        };
        let head_hash = match &self.head_hash {
            Some(value) => parse_hash("head_hash", value)?,
            None => genesis_hash,
        };

        Ok(SessionConfig {
            keys,
            client_id: self.client_id,
            p2p_version: self.p2p_version,
            capabilities: self
                .capabilities
                .into_iter()
                .map(|c| Capability::new(c.name, c.version))
                .collect(),
            listen_port: self.listen_port,
            network_id: self.network_id,
            genesis_hash,
            head_hash,
            total_difficulty: self.total_difficulty,
        })
    }
}

/// Resolved configuration shared by every session of one node.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub keys: StaticKeys,
    pub client_id: String,
    pub p2p_version: u64,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub network_id: u64,
    pub genesis_hash: [u8; 32],
    pub head_hash: [u8; 32],
    pub total_difficulty: u128,
}

impl SessionConfig {
    /// Defaults around the given identity.
    pub fn new(keys: StaticKeys) -> Self {
        Self {
            keys,
            client_id: default_client_id(),
            p2p_version: default_p2p_version(),
            capabilities: vec![Capability::eth()],
            listen_port: 0,
            network_id: default_network_id(),
            genesis_hash: MAINNET_GENESIS,
            head_hash: MAINNET_GENESIS,
            total_difficulty: MAINNET_GENESIS_DIFFICULTY,
        }
    }

    /// Our wire-format node id.
    pub fn node_id(&self) -> PeerId {
        PeerId::from_public_key(&self.keys.public)
    }

    /// The `Hello` packet this node announces.
    pub fn hello(&self) -> Hello {
        Hello {
            protocol_version: self.p2p_version,
            client_id: self.client_id.clone(),
            capabilities: self.capabilities.clone(),
            listen_port: self.listen_port,
            node_id: self.node_id(),
        }
    }

    /// The `Status` packet describing our chain view.
    pub fn status(&self) -> Status {
        Status {
            version: ETH_PROTOCOL_VERSION,
            network_id: self.network_id,
            total_difficulty: self.total_difficulty,
            head_hash: self.head_hash,
            genesis_hash: self.genesis_hash,
        }
    }

    /// Whether we advertise an `eth` capability.
    pub fn supports_eth(&self) -> bool {
        self.capabilities.iter().any(|c| c.name == "eth")
    }
}

// ============================================================================
// Tests
// ============================================================================
