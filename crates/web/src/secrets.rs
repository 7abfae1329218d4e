//! Argon2 hashing off the async reactor
//!
//! Hashes and verifications run on tokio's blocking pool.

use fossorial_common::crypto;
use fossorial_common::{Error, Result};

pub async fn hash_secret(secret: String) -> Result<String> {
    tokio::task::spawn_blocking(move || crypto::hash_secret(&secret))
        .await
        .map_err(|e| Error::Internal(format!("hashing task failed: {}", e)))?
}

pub async fn verify_secret(secret: String, stored_hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || crypto::verify_secret(&secret, &stored_hash))
        .await
        .map_err(|e| Error::Internal(format!("verification task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_then_verify() {
        let hash = hash_secret("hunter2".to_string()).await.unwrap();
        assert_ne!(hash, "hunter2");
        assert!(verify_secret("hunter2".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_secret("hunter3".to_string(), hash).await.unwrap());
    }
}
