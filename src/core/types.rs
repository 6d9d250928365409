use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::protocol::ProtocolConfig;

/// Text encoding used to spell a message value before its digits are summed
///
/// Only the checksum depends on it; frames themselves are raw big-endian
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    /// 7-bit ASCII, the encoding peer firmware uses
    #[default]
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "utf-8")]
    Utf8,
    /// UTF-16 big endian, no byte order mark
    #[serde(rename = "utf-16be")]
    Utf16Be,
    /// UTF-16 little endian, no byte order mark
    #[serde(rename = "utf-16le")]
    Utf16Le,
    /// EBCDIC code page 037
    #[serde(rename = "ebcdic")]
    Ebcdic,
}

impl TextEncoding {
    /// Encodes a string of decimal digits into bytes
    ///
    /// Digits are the only characters a checksum ever spells, so EBCDIC only
    /// maps `0`-`9`.
    pub fn encode_digits(&self, digits: &str) -> Vec<u8> {
        match self {
            TextEncoding::Ascii | TextEncoding::Utf8 => digits.as_bytes().to_vec(),
            TextEncoding::Utf16Be => digits.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            TextEncoding::Utf16Le => digits.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            TextEncoding::Ebcdic => digits
                .bytes()
                .map(|b| match b {
                    b'0'..=b'9' => 0xF0 + (b - b'0'),
                    other => other,
                })
                .collect(),
        }
    }

    /// Canonical name, as accepted by `FromStr`
    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ascii",
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Ebcdic => "ebcdic",
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "utf-16be" | "utf16be" => Ok(TextEncoding::Utf16Be),
            "utf-16le" | "utf16le" => Ok(TextEncoding::Utf16Le),
            "ebcdic" | "cp037" | "ibm037" => Ok(TextEncoding::Ebcdic),
            other => Err(Error::config(format!("unsupported text encoding: {}", other))),
        }
    }
}

/// Configuration for an SCOM link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Serial port name, e.g. `/dev/ttyACM0` or `COM3`
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Encoding the checksum digits are summed under
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Protocol timing
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: String::new(),
            baud_rate: super::DEFAULT_BAUD_RATE,
            encoding: TextEncoding::Ascii,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Creates a configuration for a named port with default settings
    pub fn for_port(port: impl Into<String>) -> Self {
        Config {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Checks settings that would make the link unusable
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::config("baud rate must be positive"));
        }
        self.protocol.validate()
    }

    /// Like `validate`, and also requires a port name
    pub fn validate_serial(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::config("serial port name is empty"));
        }
        self.validate()
    }
}
