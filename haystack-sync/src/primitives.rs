//! Module for primitive structs associated with the scan engine

use std::fmt;
use std::str::FromStr;

use getset::CopyGetters;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Position of a one-time public key within the ledger's full ordered output set.
pub type GlobalIndex = u64;

macro_rules! hex_bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Parses 64 hex characters.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;

                Ok(Self(bytes))
            }

            /// Lowercase hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }
    };
}

hex_bytes32!(
    /// Transaction hash
    TxId
);
hex_bytes32!(
    /// Block hash
    BlockHash
);
hex_bytes32!(
    /// One-time public key (stealth address) created as a transaction output
    OneTimeKey
);

/// Height and hash of a scanned block.
///
/// Two summaries are the same block iff their hashes match.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct BlockSummary {
    /// Block height
    height: u64,
    /// Block hash
    hash: BlockHash,
}

impl BlockSummary {
    /// Constructs a new block summary
    pub fn from_parts(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl PartialEq for BlockSummary {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

/// Block header fields the engine needs for continuity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct BlockHeader {
    /// Block height
    height: u64,
    /// Block hash
    hash: BlockHash,
    /// Hash of the parent block
    prev_hash: BlockHash,
}

impl BlockHeader {
    /// Constructs a new block header
    pub fn from_parts(height: u64, hash: BlockHash, prev_hash: BlockHash) -> Self {
        Self {
            height,
            hash,
            prev_hash,
        }
    }
}

/// A block as reported by the ledger node.
#[derive(Debug, Clone, PartialEq, Eq, CopyGetters)]
pub struct Block {
    /// Block header
    #[getset(get_copy = "pub")]
    header: BlockHeader,
    tx_hashes: Option<Vec<TxId>>,
}

impl Block {
    /// `tx_hashes` is `None` when the node omitted the list, which means the block has no
    /// transactions besides the coinbase.
    pub fn from_parts(header: BlockHeader, tx_hashes: Option<Vec<TxId>>) -> Self {
        Self { header, tx_hashes }
    }

    /// Non-coinbase transaction hashes in block order.
    pub fn tx_hashes(&self) -> &[TxId] {
        self.tx_hashes.as_deref().unwrap_or_default()
    }

    /// Height and hash of this block.
    pub fn summary(&self) -> BlockSummary {
        BlockSummary::from_parts(self.header.height, self.header.hash)
    }
}

/// Ledger transaction reduced to the data needed for matching.
///
/// Equality is by hash only: a refetch of the same transaction after a reorg may carry a new
/// height or timestamp and still be the same transaction.
#[derive(Debug, Clone, Eq, Serialize, Deserialize, CopyGetters)]
pub struct Transaction {
    /// Transaction hash
    #[getset(get_copy = "pub")]
    hash: TxId,
    /// Height of the block that includes the transaction
    #[getset(get_copy = "pub")]
    height: u64,
    /// Block timestamp
    #[getset(get_copy = "pub")]
    timestamp: u64,
    inputs: Vec<GlobalIndex>,
    outputs: Vec<OneTimeKey>,
}

impl Transaction {
    /// Constructs a new transaction
    pub fn from_parts(
        hash: TxId,
        height: u64,
        timestamp: u64,
        inputs: Vec<GlobalIndex>,
        outputs: Vec<OneTimeKey>,
    ) -> Self {
        Self {
            hash,
            height,
            timestamp,
            inputs,
            outputs,
        }
    }

    /// Global indexes of every ring member across all inputs, decoys included.
    pub fn inputs(&self) -> &[GlobalIndex] {
        &self.inputs
    }

    /// One-time public keys created by this transaction, in output order.
    pub fn outputs(&self) -> &[OneTimeKey] {
        &self.outputs
    }

    /// How this transaction relates to an owned one-time key.
    pub fn match_kind(&self, pubkey: &OneTimeKey) -> MatchKind {
        if self.outputs.contains(pubkey) {
            MatchKind::Created
        } else {
            MatchKind::Referenced
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

/// One of the holder's owned one-time public keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct IdentifierSlot {
    /// Position in the ledger's output set
    global_index: GlobalIndex,
    /// The one-time key at that position
    pubkey: OneTimeKey,
}

impl IdentifierSlot {
    /// Constructs a new identifier slot
    pub fn from_parts(global_index: GlobalIndex, pubkey: OneTimeKey) -> Self {
        Self {
            global_index,
            pubkey,
        }
    }
}

/// Relation between a matched transaction and the slot it was filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The transaction created the slot's one-time key.
    Created,
    /// The slot's key is a ring member of one of the inputs. Whether this is the real spend or a
    /// decoy cannot be told from ledger data alone.
    Referenced,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKind::Created => write!(f, "Pubkey was created"),
            MatchKind::Referenced => write!(f, "Pubkey was referenced in a ring"),
        }
    }
}
