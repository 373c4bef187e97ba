//! Digest, MAC, encoding and randomness helpers behind the `crypt` library

use base64::Engine;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Largest buffer `random_bytes` will produce
pub const MAX_RANDOM_BYTES: usize = 1024 * 1024;

/// Crypto helper errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("HMAC is not available for {0}")]
    MacUnsupported(&'static str),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
    #[error("Invalid byte count {0} (must be 1-{MAX_RANDOM_BYTES})")]
    InvalidLength(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse a case-insensitive algorithm name
    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Md5 => md5::compute(data).0.to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Lower-case hex digest, the form scripts see
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    hex::encode(digest(algorithm, data))
}

pub fn hmac(algorithm: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    fn run<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = <M as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match algorithm {
        HashAlgorithm::Md5 => Err(CryptoError::MacUnsupported("md5")),
        HashAlgorithm::Sha256 => run::<Hmac<Sha256>>(key, data),
        HashAlgorithm::Sha384 => run::<Hmac<Sha384>>(key, data),
        HashAlgorithm::Sha512 => run::<Hmac<Sha512>>(key, data),
    }
}

pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))
}

pub fn hex_encode(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn hex_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(text.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))
}

pub fn random_bytes(count: i64) -> Result<Vec<u8>, CryptoError> {
    let len = usize::try_from(count)
        .ok()
        .filter(|n| (1..=MAX_RANDOM_BYTES).contains(n))
        .ok_or(CryptoError::InvalidLength(count))?;
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    Ok(out)
}

/// 32 random bytes, base64 encoded
pub fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    base64_encode(&key)
}

/// Uniform integer in `[min, max]`; bounds may come in either order
pub fn random_int(min: i64, max: i64) -> i64 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    rand::thread_rng().gen_range(lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(
            digest_hex(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            digest_hex(HashAlgorithm::Md5, b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(digest(HashAlgorithm::Sha384, b"").len(), 48);
        assert_eq!(digest(HashAlgorithm::Sha512, b"").len(), 64);
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(HashAlgorithm::parse("SHA256").unwrap(), HashAlgorithm::Sha256);
        assert!(matches!(
            HashAlgorithm::parse("whirlpool"),
            Err(CryptoError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn hmac_sha256_rfc4231_case2() {
        let mac = hmac(HashAlgorithm::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert_eq!(
            hmac(HashAlgorithm::Md5, b"k", b"d"),
            Err(CryptoError::MacUnsupported("md5"))
        );
    }

    #[test]
    fn encodings() {
        assert_eq!(base64_encode(b"hello"), "aGVsbG8=");
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), b"hello");
        assert!(base64_decode("***").is_err());
        assert_eq!(hex_encode(&[0xde, 0xad]), "dead");
        assert_eq!(hex_decode("DEAD").unwrap(), vec![0xde, 0xad]);
        assert!(hex_decode("abc").is_err());
    }

    #[test]
    fn random_bounds() {
        assert_eq!(random_bytes(16).unwrap().len(), 16);
        assert_eq!(random_bytes(0), Err(CryptoError::InvalidLength(0)));
        assert!(random_bytes(MAX_RANDOM_BYTES as i64 + 1).is_err());
        assert_eq!(base64_decode(&generate_key()).unwrap().len(), 32);
        for _ in 0..100 {
            let n = random_int(10, 5);
            assert!((5..=10).contains(&n));
        }
    }
}
