//! Authenticator AAGUID handling.
//!
//! The AAGUID sits inside the attestation object's authenticator data. We
//! only need that one field, so a small CBOR walker pulls the `authData`
//! byte string out of the top-level map instead of bringing in a full CBOR
//! stack. Known AAGUIDs resolve to display names from the bundled table.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct KnownAaguid {
    pub name: String,
    #[serde(default)]
    pub icon_dark: String,
    #[serde(default)]
    pub icon_light: String,
}

pub struct AaguidTable {
    entries: HashMap<String, KnownAaguid>,
}

impl AaguidTable {
    pub fn bundled() -> Self {
        let entries: HashMap<String, KnownAaguid> =
            serde_json::from_str(include_str!("../../assets/aaguid.json"))
                .expect("bundled aaguid.json is valid");
        Self { entries }
    }

    pub fn resolve_name(&self, aaguid: &str) -> String {
        self.entries
            .get(aaguid)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| "Unnamed passkey".to_string())
    }

    pub fn get(&self, aaguid: &str) -> Option<&KnownAaguid> {
        self.entries.get(aaguid)
    }
}

/// Canonical hyphenated form; all-zero input maps to the zero UUID.
pub fn format_aaguid(bytes: &[u8]) -> String {
    let mut buf = [0u8; 16];
    if bytes.len() == 16 {
        buf.copy_from_slice(bytes);
    }
    let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

struct CborReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborReader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn header(&mut self) -> Option<(u8, u64)> {
        let first = self.take(1)?[0];
        let major = first >> 5;
        let info = first & 0x1f;
        let length = match info {
            0..=23 => info as u64,
            24 => self.take(1)?[0] as u64,
            25 => u16::from_be_bytes(self.take(2)?.try_into().ok()?) as u64,
            26 => u32::from_be_bytes(self.take(4)?.try_into().ok()?) as u64,
            27 => u64::from_be_bytes(self.take(8)?.try_into().ok()?),
            // Indefinite lengths do not appear in WebAuthn attestations.
            _ => return None,
        };
        Some((major, length))
    }

    fn skip_value(&mut self) -> Option<()> {
        let (major, length) = self.header()?;
        match major {
            0 | 1 => {}
            2 | 3 => {
                self.take(length as usize)?;
            }
            4 => {
                for _ in 0..length {
                    self.skip_value()?;
                }
            }
            5 => {
                for _ in 0..length * 2 {
                    self.skip_value()?;
                }
            }
            6 => self.skip_value()?,
            7 => {}
            _ => return None,
        }
        Some(())
    }
}

/// Pull the AAGUID (authData bytes 37..53) out of a CBOR attestation object.
pub fn extract_aaguid(attestation_object: &[u8]) -> Option<[u8; 16]> {
    let mut r = CborReader {
        buf: attestation_object,
        pos: 0,
    };
    let (major, entries) = r.header()?;
    if major != 5 {
        return None;
    }
    for _ in 0..entries {
        let (key_major, key_len) = r.header()?;
        if key_major != 3 {
            return None;
        }
        let key = r.take(key_len as usize)?;
        if key == b"authData" {
            let (value_major, value_len) = r.header()?;
            if value_major != 2 {
                return None;
            }
            let auth_data = r.take(value_len as usize)?;
            let aaguid = auth_data.get(37..53)?;
            return aaguid.try_into().ok();
        }
        r.skip_value()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attestation_with_aaguid(aaguid: [u8; 16]) -> Vec<u8> {
        // {"fmt": "none", "attStmt": {}, "authData": <bytes>}
        let mut auth_data = vec![0u8; 37];
        auth_data.extend_from_slice(&aaguid);
        auth_data.extend_from_slice(&[0x00, 0x00]); // credential id length

        let mut out = vec![0xa3];
        out.extend_from_slice(&[0x63]);
        out.extend_from_slice(b"fmt");
        out.extend_from_slice(&[0x64]);
        out.extend_from_slice(b"none");
        out.extend_from_slice(&[0x67]);
        out.extend_from_slice(b"attStmt");
        out.push(0xa0);
        out.extend_from_slice(&[0x68]);
        out.extend_from_slice(b"authData");
        out.push(0x58);
        out.push(auth_data.len() as u8);
        out.extend_from_slice(&auth_data);
        out
    }

    #[test]
    fn test_extract_aaguid() {
        let aaguid = [0xab; 16];
        let att = attestation_with_aaguid(aaguid);
        assert_eq!(extract_aaguid(&att), Some(aaguid));
    }

    #[test]
    fn test_extract_from_garbage_is_none() {
        assert_eq!(extract_aaguid(b"not cbor at all"), None);
        assert_eq!(extract_aaguid(&[]), None);
    }

    #[test]
    fn test_format_aaguid() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xfb;
        bytes[1] = 0xfc;
        assert_eq!(
            format_aaguid(&bytes),
            "fbfc0000-0000-0000-0000-000000000000"
        );
        // Wrong length falls back to the zero UUID.
        assert_eq!(
            format_aaguid(&[1, 2, 3]),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_bundled_table_resolves() {
        let table = AaguidTable::bundled();
        assert_eq!(
            table.resolve_name("00000000-0000-0000-0000-000000000000"),
            "Unnamed passkey"
        );
        assert_eq!(
            table.resolve_name("fbfc3007-154e-4ecc-8c0b-6e020557d7bd"),
            "iCloud Keychain"
        );
    }
}
