//! Persistent registries for the chat server.
//!
//! Two tiny JSON files back the whole system: users (username to public
//! key) and invite tokens (token to issuance time). Both are loaded once
//! at startup and flushed as whole pretty-printed objects; each flush
//! writes a sibling temp file and renames it over the target so a crash
//! mid-write cannot corrupt the registry.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use crate::core::error::ChatError;

pub const TOKEN_BYTES: usize = 16;
/// Tokens older than this never validate.
pub const TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;

async fn load_map<V>(path: &Path) -> Result<HashMap<String, V>, ChatError>
where
    V: serde::Serialize + serde::de::DeserializeOwned,
{
    match fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let empty = HashMap::new();
            flush_map(path, &empty).await?;
            Ok(empty)
        }
        Err(e) => Err(ChatError::Io(e)),
    }
}

async fn flush_map<V: serde::Serialize>(
    path: &Path,
    map: &HashMap<String, V>,
) -> Result<(), ChatError> {
    let text = serde_json::to_string_pretty(map)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

// ============================================================================
// USER REGISTRY
// ============================================================================

/// `{username: pubkey_b64}`. The public key text is opaque here; the auth
/// engine decodes it when a signature is checked.
pub struct UserRegistry {
    path: PathBuf,
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl UserRegistry {
    /// Load the registry, creating an empty file when none exists.
    pub async fn load(path: &Path) -> Result<Self, ChatError> {
        let users = load_map(path).await?;
        Ok(UserRegistry {
            path: path.to_path_buf(),
            users: Arc::new(RwLock::new(users)),
        })
    }

    /// Insert iff the username is absent; flushes on success.
    pub async fn register(&self, username: &str, pubkey: &str) -> Result<bool, ChatError> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), pubkey.to_string());
        flush_map(&self.path, &users).await?;
        Ok(true)
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.read().await.contains_key(username)
    }

    pub async fn get_pubkey(&self, username: &str) -> Option<String> {
        self.users.read().await.get(username).cloned()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

// ============================================================================
// TOKEN REGISTRY
// ============================================================================

/// `{token_b64: unix_seconds}`. Tokens are single-use invitations:
/// a successful validate removes the token, and expired tokens are swept
/// on load and dropped when a validate touches them.
pub struct TokenRegistry {
    path: PathBuf,
    tokens: Arc<RwLock<HashMap<String, i64>>>,
}

impl TokenRegistry {
    pub async fn load(path: &Path) -> Result<Self, ChatError> {
        let mut tokens: HashMap<String, i64> = load_map(path).await?;
        let cutoff = Utc::now().timestamp() - TOKEN_TTL_SECS;
        let before = tokens.len();
        tokens.retain(|_, &mut issued| issued > cutoff);
        if tokens.len() != before {
            flush_map(path, &tokens).await?;
        }
        Ok(TokenRegistry {
            path: path.to_path_buf(),
            tokens: Arc::new(RwLock::new(tokens)),
        })
    }

    /// Mint a fresh token and persist it. An RNG failure is an error.
    pub async fn issue(&self) -> Result<String, ChatError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes)?;
        let token = BASE64.encode(bytes);
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.clone(), Utc::now().timestamp());
        flush_map(&self.path, &tokens).await?;
        Ok(token)
    }

    /// True iff the token is present and inside its TTL; in that case it
    /// is consumed. An expired token is removed and reported invalid.
    /// The whole check-remove-flush runs under the write lock, so two
    /// concurrent validates cannot both spend one token.
    pub async fn validate(&self, token: &str) -> Result<bool, ChatError> {
        let mut tokens = self.tokens.write().await;
        let issued = match tokens.get(token) {
            Some(&issued) => issued,
            None => return Ok(false),
        };
        tokens.remove(token);
        flush_map(&self.path, &tokens).await?;
        Ok(issued > Utc::now().timestamp() - TOKEN_TTL_SECS)
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, token: &str, issued: i64) {
        self.tokens.write().await.insert(token.to_string(), issued);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ironchat-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn missing_users_file_is_created_empty() {
        let path = temp_path("users-missing");
        let _ = std::fs::remove_file(&path);
        let users = UserRegistry::load(&path).await.unwrap();
        assert_eq!(users.len().await, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn register_is_insert_iff_absent_and_persists() {
        let path = temp_path("users-register");
        let _ = std::fs::remove_file(&path);
        let users = UserRegistry::load(&path).await.unwrap();
        assert!(users.register("alice", "cHVia2V5").await.unwrap());
        assert!(!users.register("alice", "b3RoZXI=").await.unwrap());
        assert_eq!(users.get_pubkey("alice").await.as_deref(), Some("cHVia2V5"));
        assert_eq!(users.get_pubkey("bob").await, None);

        // reload sees the flushed entry
        let reloaded = UserRegistry::load(&path).await.unwrap();
        assert!(reloaded.contains("alice").await);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let path = temp_path("tokens-single-use");
        let _ = std::fs::remove_file(&path);
        let tokens = TokenRegistry::load(&path).await.unwrap();
        let token = tokens.issue().await.unwrap();
        assert!(tokens.validate(&token).await.unwrap());
        assert!(!tokens.validate(&token).await.unwrap());
        assert_eq!(tokens.len().await, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let path = temp_path("tokens-unknown");
        let _ = std::fs::remove_file(&path);
        let tokens = TokenRegistry::load(&path).await.unwrap();
        assert!(!tokens.validate("bm90LWEtdG9rZW4=").await.unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn expired_token_is_rejected_and_removed() {
        let path = temp_path("tokens-expired");
        let _ = std::fs::remove_file(&path);
        let tokens = TokenRegistry::load(&path).await.unwrap();
        let stale = Utc::now().timestamp() - TOKEN_TTL_SECS - 60;
        tokens.insert_raw("b2xkLXRva2Vu", stale).await;
        assert!(!tokens.validate("b2xkLXRva2Vu").await.unwrap());
        assert_eq!(tokens.len().await, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn expired_tokens_are_swept_on_load() {
        let path = temp_path("tokens-sweep");
        let stale = Utc::now().timestamp() - TOKEN_TTL_SECS - 60;
        let fresh = Utc::now().timestamp();
        std::fs::write(
            &path,
            format!("{{\"b2xk\": {}, \"ZnJlc2g=\": {}}}", stale, fresh),
        )
        .unwrap();
        let tokens = TokenRegistry::load(&path).await.unwrap();
        assert_eq!(tokens.len().await, 1);
        assert!(tokens.validate("ZnJlc2g=").await.unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn issued_tokens_are_distinct() {
        let path = temp_path("tokens-distinct");
        let _ = std::fs::remove_file(&path);
        let tokens = TokenRegistry::load(&path).await.unwrap();
        let a = tokens.issue().await.unwrap();
        let b = tokens.issue().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), TOKEN_BYTES);
        let _ = std::fs::remove_file(&path);
    }
}
