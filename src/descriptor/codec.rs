//! Encoding and decoding of the binary layouts.

use thiserror::Error;

use super::checksum::crc16;
use super::{
    CommandId, Descriptor, DescriptorFields, FormatVersion, SecurityFlags, EXTENDED_LEN,
    MAGIC_PREFIX, SIGNATURE_LEN, STANDARD_LEN,
};

const HASH_AT: usize = 4;
const FLAGS_AT: usize = 8;
const HINT_AT: usize = 12;
const RESERVED_AT: usize = 20;
const SIGNATURE_AT: usize = 22;
const SIGNATURE_END: usize = SIGNATURE_AT + SIGNATURE_LEN;

/// Descriptor encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input length does not match the layout announced by the magic.
    #[error("invalid descriptor length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Length required by the layout.
        expected: usize,
        /// Length received.
        actual: usize,
    },
    /// The first three bytes are not `TCP`.
    #[error("unknown descriptor magic {0:02x?}")]
    UnknownMagic([u8; 3]),
    /// The version byte is not one this build understands.
    #[error("unsupported descriptor version {0}")]
    UnsupportedVersion(u8),
    /// Stored checksum does not match the content.
    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum carried in the descriptor.
        stored: u16,
        /// Checksum computed over the content.
        computed: u16,
    },
    /// Flags contain contradictory or unknown bits.
    #[error("malformed security flags {flags:#010x} (offending bits {offending:#010x})")]
    MalformedFlags {
        /// Full flag word.
        flags: u32,
        /// Bits that broke the exclusion rules.
        offending: u32,
    },
    /// A field cannot be encoded.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Encode fresh fields into the 24-byte layout.
///
/// # Errors
///
/// Returns [`CodecError::InvalidField`] for contradictory or unknown flags,
/// or for non-zero reserved bits.
pub fn encode(fields: &DescriptorFields) -> Result<[u8; STANDARD_LEN], CodecError> {
    validate(fields)?;
    let descriptor = assemble(FormatVersion::Standard, fields, None);
    let mut out = [0u8; STANDARD_LEN];
    fill(&descriptor, &mut out);
    Ok(out)
}

/// Encode fresh fields plus a signature into the 32-byte layout.
///
/// # Errors
///
/// Same conditions as [`encode`].
pub fn encode_extended(
    fields: &DescriptorFields,
    signature: [u8; SIGNATURE_LEN],
) -> Result<[u8; EXTENDED_LEN], CodecError> {
    validate(fields)?;
    let descriptor = assemble(FormatVersion::Extended, fields, Some(signature));
    let mut out = [0u8; EXTENDED_LEN];
    fill(&descriptor, &mut out);
    Ok(out)
}

/// Decode and validate one descriptor.
///
/// The input length selects the layout and the checksum is verified before
/// any header field is trusted, so corruption anywhere in the record,
/// magic included, surfaces as [`CodecError::ChecksumMismatch`]. Flag
/// validation then runs over the whole word without branching on
/// individual bits.
///
/// # Errors
///
/// Returns the first [`CodecError`] encountered, in the order length,
/// checksum, magic, version, version/length agreement, flags.
pub fn decode(bytes: &[u8]) -> Result<Descriptor, CodecError> {
    let layout = match bytes.len() {
        STANDARD_LEN => FormatVersion::Standard,
        EXTENDED_LEN => FormatVersion::Extended,
        actual => {
            let expected = peek_version(bytes).map_or(STANDARD_LEN, FormatVersion::encoded_len);
            return Err(CodecError::InvalidLength { expected, actual });
        }
    };

    let body = bytes.len().saturating_sub(2);
    let stored = be_u16(bytes, body);
    let computed = crc16(&bytes[..body]);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }

    let version = peek_version(bytes)?;
    if version != layout {
        return Err(CodecError::InvalidLength {
            expected: version.encoded_len(),
            actual: bytes.len(),
        });
    }

    let security_flags = SecurityFlags::from_bits_retain(be_u32(bytes, FLAGS_AT));
    let offending = security_flags.violations();
    if offending != 0 {
        return Err(CodecError::MalformedFlags {
            flags: security_flags.bits(),
            offending,
        });
    }

    let signature = match version {
        FormatVersion::Standard => None,
        FormatVersion::Extended => {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&bytes[SIGNATURE_AT..SIGNATURE_END]);
            Some(sig)
        }
    };

    Ok(Descriptor {
        version,
        command: CommandId::new(be_u32(bytes, HASH_AT)),
        security_flags,
        performance_hint: be_u64(bytes, HINT_AT),
        reserved: be_u16(bytes, RESERVED_AT),
        signature,
        checksum: stored,
    })
}

/// Split a concatenation of descriptors into per-record slices.
///
/// Each record's length is taken from its magic. Splitting stops at the
/// first record whose header cannot be read, returning the error together
/// with the byte offset.
pub fn split_records(bytes: &[u8]) -> Vec<Result<&[u8], (usize, CodecError)>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        match peek_version(rest) {
            Ok(version) => {
                let len = version.encoded_len();
                if rest.len() < len {
                    records.push(Err((
                        offset,
                        CodecError::InvalidLength {
                            expected: len,
                            actual: rest.len(),
                        },
                    )));
                    break;
                }
                records.push(Ok(&rest[..len]));
                offset = offset.saturating_add(len);
            }
            Err(err) => {
                records.push(Err((offset, err)));
                break;
            }
        }
    }
    records
}

/// Re-encode a decoded descriptor as-is.
pub(super) fn write(descriptor: &Descriptor) -> Vec<u8> {
    let mut out = vec![0u8; descriptor.version.encoded_len()];
    fill(descriptor, &mut out);
    out
}

/// Checksum the descriptor's current content would carry.
pub(super) fn checksum_of(descriptor: &Descriptor) -> u16 {
    let bytes = write(descriptor);
    crc16(&bytes[..bytes.len().saturating_sub(2)])
}

fn validate(fields: &DescriptorFields) -> Result<(), CodecError> {
    let offending = fields.security_flags.violations();
    if offending != 0 {
        return Err(CodecError::InvalidField {
            field: "security_flags",
            reason: format!("contradictory or unknown bits {offending:#010x}"),
        });
    }
    if fields.reserved != 0 {
        return Err(CodecError::InvalidField {
            field: "reserved",
            reason: format!("must be zero, got {:#06x}", fields.reserved),
        });
    }
    Ok(())
}

fn assemble(
    version: FormatVersion,
    fields: &DescriptorFields,
    signature: Option<[u8; SIGNATURE_LEN]>,
) -> Descriptor {
    Descriptor {
        version,
        command: fields.command,
        security_flags: fields.security_flags,
        performance_hint: fields.performance_hint,
        reserved: fields.reserved,
        signature,
        checksum: 0,
    }
}

/// Serialise every field except the checksum, then seal with a fresh one.
///
/// `out` must be exactly `descriptor.version.encoded_len()` bytes.
fn fill(descriptor: &Descriptor, out: &mut [u8]) {
    out[..3].copy_from_slice(&MAGIC_PREFIX);
    out[3] = descriptor.version.byte();
    out[HASH_AT..FLAGS_AT].copy_from_slice(&descriptor.command.value().to_be_bytes());
    out[FLAGS_AT..HINT_AT].copy_from_slice(&descriptor.security_flags.bits().to_be_bytes());
    out[HINT_AT..RESERVED_AT].copy_from_slice(&descriptor.performance_hint.to_be_bytes());
    out[RESERVED_AT..SIGNATURE_AT].copy_from_slice(&descriptor.reserved.to_be_bytes());
    if let Some(signature) = descriptor.signature {
        out[SIGNATURE_AT..SIGNATURE_END].copy_from_slice(&signature);
    }
    let body = out.len().saturating_sub(2);
    let crc = crc16(&out[..body]);
    out[body..].copy_from_slice(&crc.to_be_bytes());
}

fn peek_version(bytes: &[u8]) -> Result<FormatVersion, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::InvalidLength {
            expected: STANDARD_LEN,
            actual: bytes.len(),
        });
    }
    let mut prefix = [0u8; 3];
    prefix.copy_from_slice(&bytes[..3]);
    if prefix != MAGIC_PREFIX {
        return Err(CodecError::UnknownMagic(prefix));
    }
    FormatVersion::from_byte(bytes[3]).ok_or(CodecError::UnsupportedVersion(bytes[3]))
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[at..][..2]);
    u16::from_be_bytes(raw)
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..][..4]);
    u32::from_be_bytes(raw)
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..][..8]);
    u64::from_be_bytes(raw)
}
