//! GUID text conversion for the 16-byte system UUID carried in protocol
//! version messages.
//!
//! The first three groups travel little-endian and the last two big-endian,
//! so raw `00112233445566778899AABBCCDDEEFF` reads as
//! `33221100-5544-7766-8899-AABBCCDDEEFF`.

use uuid::Uuid;

/// Renders wire bytes as an upper-case GUID string.
pub fn guid_from_wire(raw: &[u8; 16]) -> String {
    format!("{:X}", Uuid::from_bytes_le(*raw).hyphenated())
}

/// Parses GUID text (any case, with or without hyphens) back into wire order.
pub fn guid_to_wire(text: &str) -> Result<[u8; 16], uuid::Error> {
    Ok(Uuid::parse_str(text)?.to_bytes_le())
}

/// Hex dump of raw bytes, upper case, no separators.
pub fn bytes_to_hex(raw: &[u8]) -> String {
    raw.iter().map(|byte| format!("{:02X}", byte)).collect()
}
