//! Cryptographic utilities for Fossorial
//!
//! Secret hashing (Argon2id), random token generation, WireGuard key
//! validation and idempotency keys for exit node pushes.

use crate::{Error, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Argon2 memory cost in KiB
const ARGON2_MEMORY_KIB: u32 = 19456;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| Error::Crypto(format!("invalid argon2 params: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a secret into a PHC string
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| Error::Crypto(format!("secret hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Check a secret against a stored PHC string
pub fn verify_secret(secret: &str, stored_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| Error::Crypto(format!("invalid stored hash: {}", e)))?;
    Ok(hasher()?
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}

/// Random string over `[a-zA-Z0-9]`
pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Check that a WireGuard public key is base64 of 32 bytes
pub fn validate_wireguard_key(key: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|_| Error::validation("public key is not valid base64"))?;
    if bytes.len() != 32 {
        return Err(Error::validation(format!(
            "public key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Stable key for a peer push: SHA-256 over the public key and the sorted allow-list
pub fn peer_idempotency_key(public_key: &str, allowed_ips: &[String]) -> String {
    let mut sorted: Vec<&str> = allowed_ips.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    for ip in sorted {
        hasher.update(b"\n");
        hasher.update(ip.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("hunter2"));
        assert!(verify_secret("hunter2", &hash).unwrap());
        assert!(!verify_secret("hunter3", &hash).unwrap());
    }

    #[test]
    fn test_hash_params() {
        let hash = hash_secret("s").unwrap();
        assert!(hash.contains("m=19456,t=2,p=1"));
    }

    #[test]
    fn test_random_alphanumeric() {
        let s = random_alphanumeric(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(s, random_alphanumeric(32));
    }

    #[test]
    fn test_validate_wireguard_key() {
        let key = STANDARD.encode([7u8; 32]);
        assert!(validate_wireguard_key(&key).is_ok());
        assert!(validate_wireguard_key("not base64!").is_err());
        assert!(validate_wireguard_key(&STANDARD.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_idempotency_key_ignores_order() {
        let a = peer_idempotency_key("PK1", &["10.0.0.1/32".into(), "10.0.0.3/32".into()]);
        let b = peer_idempotency_key("PK1", &["10.0.0.3/32".into(), "10.0.0.1/32".into()]);
        let c = peer_idempotency_key("PK2", &["10.0.0.1/32".into(), "10.0.0.3/32".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
