//! Tool Capability Protocol descriptors.
//!
//! A descriptor is a fixed-size, big-endian record describing what a command
//! is capable of. Two layouts exist, selected by the version byte of the
//! magic:
//!
//! ```text
//! v2 (24 bytes)                       v3 (32 bytes)
//! 0..4   magic  "TCP" 0x02            0..4   magic  "TCP" 0x03
//! 4..8   command hash                 4..8   command hash
//! 8..12  security flags               8..12  security flags
//! 12..20 performance hint             12..20 performance hint
//! 20..22 reserved                     20..22 reserved
//! 22..24 CRC-16 over 0..22            22..30 signature
//!                                     30..32 CRC-16 over 0..30
//! ```

mod checksum;
mod codec;
mod flags;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

pub use checksum::crc16;
pub use codec::{decode, encode, encode_extended, split_records, CodecError};
pub use flags::SecurityFlags;

pub(crate) use flags::FLAG_TABLE;

/// Leading three bytes of every descriptor.
pub const MAGIC_PREFIX: [u8; 3] = *b"TCP";

/// Length of a version 2 descriptor.
pub const STANDARD_LEN: usize = 24;

/// Length of a version 3 descriptor.
pub const EXTENDED_LEN: usize = 32;

/// Length of the version 3 signature field.
pub const SIGNATURE_LEN: usize = 8;

/// Highest version byte this build understands.
pub const LATEST_VERSION: u8 = 3;

// ---------------------------------------------------------------------------
// Command identifiers
// ---------------------------------------------------------------------------

/// Stable 32-bit identifier of a command.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u32);

impl CommandId {
    /// Wrap a raw hash value.
    pub const fn new(hash: u32) -> Self {
        Self(hash)
    }

    /// Derive the identifier from a command name: the first four bytes of
    /// its SHA-256 digest, big-endian.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&digest[..4]);
        Self(u32::from_be_bytes(prefix))
    }

    /// Raw hash value.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for CommandId {
    fn from(hash: u32) -> Self {
        Self(hash)
    }
}

/// Hashes the name with [`CommandId::from_name`].
impl From<&str> for CommandId {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({self})")
    }
}

impl Serialize for CommandId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Format versions
// ---------------------------------------------------------------------------

/// Descriptor layout, selected by the magic's version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatVersion {
    /// Version 2: 24-byte layout.
    Standard,
    /// Version 3: 32-byte layout with a signature field.
    Extended,
}

impl FormatVersion {
    /// Map a version byte to a layout.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            2 => Some(Self::Standard),
            3 => Some(Self::Extended),
            _ => None,
        }
    }

    /// Version byte written into the magic.
    pub const fn byte(self) -> u8 {
        match self {
            Self::Standard => 2,
            Self::Extended => 3,
        }
    }

    /// Encoded length for this layout.
    pub const fn encoded_len(self) -> usize {
        match self {
            Self::Standard => STANDARD_LEN,
            Self::Extended => EXTENDED_LEN,
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Caller-supplied content of a new descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorFields {
    /// Command this descriptor describes.
    pub command: CommandId,
    /// Capability predicates.
    pub security_flags: SecurityFlags,
    /// Opaque prioritisation hint. Never consulted for security decisions.
    pub performance_hint: u64,
    /// Reserved bits. Must be zero when encoding fresh fields.
    pub reserved: u16,
}

impl DescriptorFields {
    /// Fields with a zero performance hint and zero reserved bits.
    pub fn new(command: impl Into<CommandId>, security_flags: SecurityFlags) -> Self {
        Self {
            command: command.into(),
            security_flags,
            performance_hint: 0,
            reserved: 0,
        }
    }

    /// Set the performance hint.
    #[must_use]
    pub fn with_performance_hint(mut self, hint: u64) -> Self {
        self.performance_hint = hint;
        self
    }
}

/// A decoded, validated descriptor.
///
/// Values only come out of [`decode`], so every `Descriptor` satisfies the
/// checksum and flag invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    version: FormatVersion,
    command: CommandId,
    security_flags: SecurityFlags,
    performance_hint: u64,
    reserved: u16,
    #[serde(serialize_with = "serialize_signature")]
    signature: Option<[u8; SIGNATURE_LEN]>,
    checksum: u16,
}

impl Descriptor {
    /// Layout the descriptor was decoded from.
    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// Command identifier.
    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Capability predicates.
    pub fn security_flags(&self) -> SecurityFlags {
        self.security_flags
    }

    /// Opaque performance hint.
    pub fn performance_hint(&self) -> u64 {
        self.performance_hint
    }

    /// Reserved bits as received.
    pub fn reserved(&self) -> u16 {
        self.reserved
    }

    /// Extended-layout signature, if any.
    pub fn signature(&self) -> Option<[u8; SIGNATURE_LEN]> {
        self.signature
    }

    /// Stored checksum.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// The encodable content of this descriptor.
    pub fn fields(&self) -> DescriptorFields {
        DescriptorFields {
            command: self.command,
            security_flags: self.security_flags,
            performance_hint: self.performance_hint,
            reserved: self.reserved,
        }
    }

    /// Re-encode, preserving reserved bits and signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::write(self)
    }

    /// Copy of this descriptor with the reserved bits cleared and the
    /// checksum recomputed.
    #[must_use]
    pub fn with_reserved_cleared(&self) -> Self {
        let mut cleared = Self {
            reserved: 0,
            ..*self
        };
        cleared.checksum = codec::checksum_of(&cleared);
        cleared
    }
}

/// Registry entry: a descriptor plus where and when it was registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    /// The registered descriptor.
    pub descriptor: Descriptor,
    /// When the entry was registered.
    pub registered_at: DateTime<Utc>,
    /// Reference to the source of truth (file path, admin ticket, ...).
    pub source: String,
}

fn serialize_signature<S: Serializer>(
    signature: &Option<[u8; SIGNATURE_LEN]>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match signature {
        Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
        None => serializer.serialize_none(),
    }
}
