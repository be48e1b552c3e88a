use std::fmt::{Display, Formatter};
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use mongodb::bson::Bson;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Failure to parse a `0x`-prefixed hex value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("expected {expected} bytes, found {found}")]
    WrongLength { expected: usize, found: usize },
    #[error("invalid hex: {0}")]
    Invalid(String),
}

/// Decode a hex string, with or without a leading `0x`. Odd-length strings are
/// left-padded with a zero, as nodes do for quantities.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, HexError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{digits}");
        padded.as_str()
    } else {
        digits
    };
    HEXLOWER_PERMISSIVE
        .decode(digits.as_bytes())
        .map_err(|e| HexError::Invalid(e.to_string()))
}

/// Encode bytes as a `0x`-prefixed lowercase hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", HEXLOWER.encode(bytes))
}

/// Parse a JSON-RPC hex quantity such as `0x1b4`.
pub fn decode_quantity(value: &str) -> Result<u64, HexError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| HexError::Invalid(e.to_string()))
}

/// Encode a JSON-RPC hex quantity.
pub fn encode_quantity(value: u64) -> String {
    format!("{value:#x}")
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LENGTH: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = HexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = decode_hex(s)?;
                let array: [u8; $len] = bytes.as_slice().try_into().map_err(|_| {
                    HexError::WrongLength {
                        expected: $len,
                        found: bytes.len(),
                    }
                })?;
                Ok(Self(array))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", encode_hex(&self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let string = String::deserialize(deserializer)?;
                string.parse().map_err(D::Error::custom)
            }
        }

        impl From<$name> for Bson {
            fn from(value: $name) -> Self {
                Bson::String(value.to_string())
            }
        }
    };
}

fixed_bytes!(
    /// A 20-byte account or contract address.
    Address,
    20
);

fixed_bytes!(
    /// A 32-byte transaction hash.
    TxHash,
    32
);

fixed_bytes!(
    /// A 32-byte event log topic.
    Topic,
    32
);

/// Identifier of the chain the RPC endpoint is connected to, as reported by `net_version`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<NetworkId> for Bson {
    fn from(id: NetworkId) -> Self {
        Bson::String(id.0)
    }
}

/// A transaction to submit. A `to` of `None` is a contract creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub data: Vec<u8>,
    pub gas: Option<u64>,
    /// Left to the node when `None`.
    pub nonce: Option<u64>,
}

impl Transaction {
    /// A contract-creation transaction carrying the given bytecode.
    pub fn deployment(bytecode: Vec<u8>) -> Self {
        Self {
            from: None,
            to: None,
            data: bytecode,
            gas: None,
            nonce: None,
        }
    }

    /// A call to an existing contract.
    pub fn call(to: Address, data: Vec<u8>) -> Self {
        Self {
            from: None,
            to: Some(to),
            data,
            gas: None,
            nonce: None,
        }
    }

    pub fn sent_by(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }

    /// Pin the sender nonce. At most one transaction per sender and nonce is
    /// ever mined, which makes sending the same write twice harmless.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

/// Which view of an account's transaction count to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Transactions already mined.
    Latest,
    /// Mined transactions plus those queued at the node.
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Pending => "pending",
        }
    }
}

/// The receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    /// Set only for contract creations.
    pub contract_address: Option<Address>,
    /// False if the transaction was mined but reverted.
    pub success: bool,
    pub block_number: u64,
}

/// An event emitted by a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<Topic>,
    pub data: Vec<u8>,
    pub tx_hash: TxHash,
    pub block_number: u64,
}
