//! CRC-16/CCITT-FALSE integrity check.
//!
//! Detects every single-bit error and every burst up to 16 bits. This is
//! corruption detection, not authentication.

/// Generator polynomial x^16 + x^12 + x^5 + 1.
const POLY: u16 = 0x1021;

/// Initial register value.
const INIT: u16 = 0xFFFF;

/// Compute the checksum of `data`.
///
/// The inner loop selects the polynomial with a mask instead of a branch,
/// so the running time depends only on `data.len()`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= u16::from(byte).wrapping_shl(8);
        for _ in 0..8 {
            let mask = crc.wrapping_shr(15).wrapping_neg();
            crc = crc.wrapping_shl(1) ^ (POLY & mask);
        }
    }
    crc
}
