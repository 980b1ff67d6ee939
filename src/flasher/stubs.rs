//! Stub loader module.
//!
//! Stubs are not bundled; they are read from the TOML files esptool's JSON
//! stubs convert to, configured per chip.

use std::{fs, path::Path};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// Flash stub object (deserialized from TOML)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    /// Assemble a stub from raw sections
    pub fn new(entry: u32, text_start: u32, text: &[u8], data_start: u32, data: &[u8]) -> Self {
        FlashStub {
            entry,
            text: general_purpose::STANDARD.encode(text),
            text_start,
            data: general_purpose::STANDARD.encode(data),
            data_start,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let stub: FlashStub =
            toml::from_str(s).map_err(|err| Error::InvalidStub(err.to_string()))?;

        // Both sections must decode
        stub.text()?;
        stub.data()?;

        Ok(stub)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.text_start, decode_section("text", &self.text)?))
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.data_start, decode_section("data", &self.data)?))
    }
}

fn decode_section(name: &str, encoded: &str) -> Result<Vec<u8>, Error> {
    general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| Error::InvalidStub(format!("{name} section: {err}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_stub_toml() {
        let stub = FlashStub::from_toml_str(
            r#"
            entry = 1074521516
            text = "AQIDBA=="
            text_start = 1074520064
            data = "BQY="
            data_start = 1073658536
            "#,
        )
        .unwrap();

        assert_eq!(stub.entry(), 0x400B_E5AC);
        assert_eq!(stub.text().unwrap(), (0x400B_E000, vec![1, 2, 3, 4]));
        assert_eq!(stub.data().unwrap(), (0x3FFE_BAA8, vec![5, 6]));
        assert_eq!(
            FlashStub::new(0x400B_E5AC, 0x400B_E000, &[1, 2, 3, 4], 0x3FFE_BAA8, &[5, 6]),
            stub
        );
    }

    #[test]
    fn rejects_bad_base64() {
        let result = FlashStub::from_toml_str(
            r#"
            entry = 0
            text = "not base64!"
            text_start = 0
            data = ""
            data_start = 0
            "#,
        );
        assert!(matches!(result, Err(Error::InvalidStub(_))));
    }
}
