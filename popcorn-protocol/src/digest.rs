//! 256-bit content digests
//!
//! A digest identifies file content: equal digests mean equal bytes. The
//! value is stored as four 64-bit lanes so that equality checks and hash-map
//! keys stay cheap, and travels on the wire as four big-endian words. The
//! all-zero value is the "unknown" sentinel and never names real content.

use binrw::binrw;
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{BitXor, BitXorAssign};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read buffer size for streaming file hashing
const HASH_BUF_SIZE: usize = 64 * 1024;

/// 256-bit content digest split into four 64-bit lanes
#[binrw]
#[brw(big)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentDigest {
    lanes: [u64; 4],
}

impl ContentDigest {
    /// The all-zero sentinel meaning "content not known yet"
    pub const UNKNOWN: Self = Self { lanes: [0; 4] };

    /// Build a digest from raw 32-byte hash output
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let mut lanes = [0u64; 4];
        for (lane, chunk) in lanes.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *lane = u64::from_be_bytes(word);
        }
        Self { lanes }
    }

    /// Raw 32-byte form, big-endian lane order
    pub fn to_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (lane, chunk) in self.lanes.iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&lane.to_be_bytes());
        }
        bytes
    }

    /// Hash a byte slice
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_bytes(Sha256::digest(data).into())
    }

    /// Hash a file's content without loading it whole into memory
    pub async fn of_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self::from_bytes(hasher.finalize().into()))
    }

    /// True for the all-zero sentinel
    pub fn is_unknown(&self) -> bool {
        self.lanes == [0; 4]
    }

    /// Parse the 64-hex-character form produced by [`fmt::Display`]
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl BitXor for ContentDigest {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        let mut lanes = self.lanes;
        for (lane, other) in lanes.iter_mut().zip(rhs.lanes) {
            *lane ^= other;
        }
        Self { lanes }
    }
}

impl BitXorAssign for ContentDigest {
    fn bitxor_assign(&mut self, rhs: Self) {
        *self = *self ^ rhs;
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let digest = ContentDigest::from_bytes(bytes);
        assert_eq!(digest.to_bytes(), bytes);
        assert!(!digest.is_unknown());
    }

    #[test]
    fn test_unknown_sentinel() {
        assert!(ContentDigest::UNKNOWN.is_unknown());
        assert!(ContentDigest::default().is_unknown());
        assert!(!ContentDigest::of_bytes(b"").is_unknown());
    }

    #[test]
    fn test_known_sha256_vector() {
        // sha256("abc")
        let digest = ContentDigest::of_bytes(b"abc");
        assert_eq!(
            digest.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ContentDigest::from_hex(&digest.to_string()), Some(digest));
    }

    #[test]
    fn test_xor_is_order_independent() {
        let a = ContentDigest::of_bytes(b"first");
        let b = ContentDigest::of_bytes(b"second");
        let c = ContentDigest::of_bytes(b"third");
        assert_eq!(a ^ b ^ c, c ^ a ^ b);
        assert_eq!(a ^ a, ContentDigest::UNKNOWN);
    }

    #[tokio::test]
    async fn test_file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        tokio::fs::write(&path, &data).await.expect("write");

        let from_file = ContentDigest::of_file(&path).await.expect("hash");
        assert_eq!(from_file, ContentDigest::of_bytes(&data));
    }
}
