use crc::{Algorithm, Crc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// CRC-32 with Koopman's polynomial (0xeb31d82e reflected), standard
/// all-ones init and final xor.
pub const CRC_32_KOOPMAN: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b_8cd7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x2d3d_d0ae,
    residue: 0x0843_323b,
};

const KOOPMAN: Crc<u32> = Crc::<u32>::new(&CRC_32_KOOPMAN);

/// Identifier of one encoded crop: the checksum of its exact bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentKey(u32);

impl ContentKey {
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Eight lowercase hex digits, zero padded.
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 8 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for ContentKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid content key: {}", value))
    }
}

/// Computes content keys for encoded image bytes.
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Checksum of exactly `encoded`; no normalisation is applied.
    pub fn digest(&self, encoded: &[u8]) -> ContentKey {
        ContentKey(KOOPMAN.checksum(encoded))
    }

    /// Key of an already encoded file on disk.
    pub fn digest_file(&self, file_path: &Path) -> std::io::Result<ContentKey> {
        let bytes = fs::read(file_path)?;
        Ok(self.digest(&bytes))
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}
