//! Compiled contract artifacts.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, warn};
use rocket::tokio::fs;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::ledger::{decode_hex, Address, NetworkId, TxHash};

/// Where the contract was already deployed on some network, according to the
/// artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownDeployment {
    pub address: Address,
    #[serde(default)]
    pub transaction_hash: Option<TxHash>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Where the artifact came from, for logs and errors.
    pub origin: String,
    pub abi: Value,
    /// `None` if the artifact carries an ABI only.
    pub bytecode: Option<Vec<u8>>,
    pub networks: HashMap<NetworkId, KnownDeployment>,
}

/// A place compiled contract artifacts can be found.
#[rocket::async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The artifact, if this source has one with an ABI.
    async fn load(&self) -> Result<Option<Artifact>>;
}

/// A Truffle-style JSON build artifact on disk:
/// `{"abi": [...], "bytecode": "0x...", "networks": {"<id>": {"address": "0x..."}}}`.
pub struct FileArtifactSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct BuildArtifact {
    #[serde(default)]
    abi: Option<Value>,
    #[serde(default)]
    bytecode: Option<String>,
    #[serde(default)]
    networks: HashMap<NetworkId, KnownDeployment>,
}

impl FileArtifactSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[rocket::async_trait]
impl ArtifactSource for FileArtifactSource {
    async fn load(&self) -> Result<Option<Artifact>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No artifact at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let raw: BuildArtifact = match serde_json::from_slice(&bytes) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Ignoring unreadable artifact {}: {e}", self.path.display());
                return Ok(None);
            }
        };
        let Some(abi) = raw.abi else {
            return Ok(None);
        };
        let bytecode = match raw.bytecode.as_deref().map(decode_hex).transpose() {
            Ok(code) => code.filter(|c| !c.is_empty()),
            Err(e) => {
                warn!("Ignoring bad bytecode in {}: {e}", self.path.display());
                None
            }
        };
        Ok(Some(Artifact {
            origin: self.path.display().to_string(),
            abi,
            bytecode,
            networks: raw.networks,
        }))
    }
}

/// An artifact compiled into the program or built in memory.
pub struct InlineArtifactSource {
    artifact: Artifact,
}

impl InlineArtifactSource {
    pub fn new(abi: Value, bytecode: Option<Vec<u8>>) -> Self {
        Self {
            artifact: Artifact {
                origin: "inline".to_string(),
                abi,
                bytecode,
                networks: HashMap::new(),
            },
        }
    }

    /// Record a known deployment on `network`.
    pub fn deployed_on(mut self, network: NetworkId, address: Address) -> Self {
        self.artifact.networks.insert(
            network,
            KnownDeployment {
                address,
                transaction_hash: None,
            },
        );
        self
    }
}

#[rocket::async_trait]
impl ArtifactSource for InlineArtifactSource {
    async fn load(&self) -> Result<Option<Artifact>> {
        Ok(Some(self.artifact.clone()))
    }
}

/// The first artifact with an ABI, searching sources in order.
pub async fn find_artifact(sources: &[Box<dyn ArtifactSource>]) -> Result<Option<Artifact>> {
    for source in sources {
        if let Some(artifact) = source.load().await? {
            return Ok(Some(artifact));
        }
    }
    Ok(None)
}
