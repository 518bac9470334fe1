//! Ledger-level types shared by the matcher, the broker and the sessions.
use std::{
    fmt,
    str::FromStr,
};
use num_enum::{
    IntoPrimitive, TryFromPrimitive
};
use serde::{
    de, Deserialize, Deserializer, Serialize, Serializer
};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseHexError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseHexError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))?;
    if bytes.len() != N {
        return Err(ParseHexError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// fixed size byte strings are shown and (de)serialized as 0x-prefixed hex
macro_rules! hex_bytes {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(slice: &[u8]) -> Result<Self, ParseHexError> {
                if slice.len() != $len {
                    return Err(ParseHexError::InvalidLength {
                        expected: $len,
                        actual: slice.len(),
                    });
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(slice);
                Ok(Self(out))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex_string(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// 20-byte participant identity, both the ledger account and the relay connection key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);
hex_bytes!(Address, 20);

/// 32-byte digest: task ids, task descriptor hashes and commitments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);
hex_bytes!(Hash32, 32);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

pub type TaskId = Hash32;

/// secp256k1 public key without the SEC1 tag byte, i.e. the two 32-byte
/// coordinates the ledger stores for a host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptionKey(pub [u8; 64]);
hex_bytes!(EncryptionKey, 64);

/// Tower fee schedules. Only flat fees exist on the ledger so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FeeType {
    Flat = 0,
}

impl Serialize for FeeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*self).into())
    }
}

impl<'de> Deserialize<'de> for FeeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        FeeType::try_from(raw)
            .map_err(|_| de::Error::custom(format!("unknown fee type `{raw}`")))
    }
}

// registered task, immutable once on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    // content address of the task artifact
    pub hash: Hash32,
    pub owner: Address,
    // owed to the task's registrant
    pub fee: u128,
    pub computing_type: u8,
    // declared I/O size
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub owner: Address,
    pub encryption_key: EncryptionKey,
    // max number of blocks a queued task may wait
    pub block_timeout_limit: u64,
    pub stake: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TowerRecord {
    pub owner: Address,
    pub public_connection: String,
    pub size_limit: u64,
    pub fee: u128,
    pub fee_type: FeeType,
    pub stake: u128,
}

impl TowerRecord {
    /// Fee the tower charges to relay a task of `size` for `block_timeout` blocks.
    pub fn fee_for(&self, _size: u64, _block_timeout: u64) -> u128 {
        match self.fee_type {
            FeeType::Flat => self.fee,
        }
    }
}

/// A host's opt-in to run one task descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTaskBinding {
    pub block_timeout: u64,
    pub fee: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub task: u128,
    pub tower: u128,
    pub host: u128,
    pub scheduler: u128,
    pub insurance: u128,
}

impl FeeBreakdown {
    /// Builds the breakdown and derives the insurance share, `None` on overflow.
    /// Insurance is a tenth of the other four fees, truncated.
    pub fn new(task: u128, tower: u128, host: u128, scheduler: u128) -> Option<Self> {
        let sum = task
            .checked_add(tower)?
            .checked_add(host)?
            .checked_add(scheduler)?;
        Some(FeeBreakdown {
            task,
            tower,
            host,
            scheduler,
            insurance: sum / 10,
        })
    }

    // what the submitter pays on submission
    pub fn total(&self) -> u128 {
        self.task
            .saturating_add(self.tower)
            .saturating_add(self.host)
            .saturating_add(self.scheduler)
            .saturating_add(self.insurance)
    }
}

/// A feasible (tower, host) pairing for a task, computed fresh per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub tower: Address,
    pub host: Address,
    // block at which the host is projected to have the result
    pub end_block: u64,
    pub fee: FeeBreakdown,
}

/// The ledger's record of one in-flight task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_hash: Hash32,
    pub input_hash: Hash32,
    // zero until the host registers its output
    pub output_hash: Hash32,
    pub size: u64,
    pub tower: Address,
    pub host: Address,
    pub owner: Address,
    pub start_block: u64,
    pub block_timeout: u64,
    pub fee: FeeBreakdown,
}

/// Which side of a running task a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Host,
}

impl RunningTask {
    /// A cleared record is how the ledger says the task is no longer active.
    pub fn is_cleared(&self) -> bool {
        self.task_hash.is_zero()
    }

    pub fn deadline(&self) -> u64 {
        self.start_block.saturating_add(self.block_timeout)
    }

    pub fn role_of(&self, participant: &Address) -> Option<Role> {
        if *participant == self.owner {
            Some(Role::Owner)
        } else if *participant == self.host {
            Some(Role::Host)
        } else {
            None
        }
    }

    pub fn counterparty(&self, role: Role) -> Address {
        match role {
            Role::Owner => self.host,
            Role::Host => self.owner,
        }
    }

    /// Commitment that a message sent by `role` must match.
    pub fn commitment_for(&self, role: Role) -> Hash32 {
        match role {
            Role::Owner => self.input_hash,
            Role::Host => self.output_hash,
        }
    }
}
