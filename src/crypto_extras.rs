//! Workers-specific crypto extras: constant-time comparison and the
//! streaming digest writer.

use anyhow::{anyhow, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Constant-time byte comparison. Inputs must have equal length; unequal
/// lengths are an error, not `false`, matching the platform.
pub fn timing_safe_equal(a: &[u8], b: &[u8]) -> Result<bool> {
    if a.len() != b.len() {
        return Err(anyhow!("timingSafeEqual requires equal-length inputs"));
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    Ok(diff == 0)
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Md5(Md5),
}

/// A writable stream computing a hash over everything written to it; the
/// digest is available after `close`.
pub struct DigestStream {
    hasher: Hasher,
}

impl DigestStream {
    /// Algorithm names are case-insensitive; dashes are optional
    /// (`SHA-256` and `sha256` both work).
    pub fn new(algorithm: &str) -> Result<Self> {
        let normalized = algorithm.to_ascii_lowercase().replace('-', "");
        let hasher = match normalized.as_str() {
            "sha1" => Hasher::Sha1(Sha1::new()),
            "sha256" => Hasher::Sha256(Sha256::new()),
            "sha384" => Hasher::Sha384(Sha384::new()),
            "sha512" => Hasher::Sha512(Sha512::new()),
            "md5" => Hasher::Md5(Md5::new()),
            other => return Err(anyhow!("unsupported digest algorithm '{other}'")),
        };
        Ok(Self { hasher })
    }

    pub fn write(&mut self, chunk: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha1(h) => h.update(chunk),
            Hasher::Sha256(h) => h.update(chunk),
            Hasher::Sha384(h) => h.update(chunk),
            Hasher::Sha512(h) => h.update(chunk),
            Hasher::Md5(h) => h.update(chunk),
        }
    }

    /// Close the stream and resolve the digest bytes.
    pub fn close(self) -> Vec<u8> {
        match self.hasher {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Md5(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_safe_equal_contract() {
        assert!(timing_safe_equal(b"same", b"same").unwrap());
        assert!(!timing_safe_equal(b"same", b"sama").unwrap());
        assert!(timing_safe_equal(b"short", b"longer").is_err());
    }

    #[test]
    fn digest_stream_incremental_matches_one_shot() {
        let mut stream = DigestStream::new("SHA-256").unwrap();
        stream.write(b"hello ");
        stream.write(b"world");
        let streamed = stream.close();
        let oneshot = Sha256::digest(b"hello world").to_vec();
        assert_eq!(streamed, oneshot);
    }

    #[test]
    fn algorithm_names_are_case_insensitive() {
        for name in ["sha-1", "SHA-256", "Sha384", "sha512", "MD5"] {
            assert!(DigestStream::new(name).is_ok(), "{name}");
        }
        assert!(DigestStream::new("blake3").is_err());
    }

    #[test]
    fn md5_digest_value() {
        let mut stream = DigestStream::new("md5").unwrap();
        stream.write(b"abc");
        assert_eq!(
            hex::encode(stream.close()),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
