//! Programmatic surface of the secrets artifact engine.
//!
//! An [`Engine`] bundles a shared [`KeyCache`] with the iteration count used
//! for new tokens. It is cheap to clone; clones share the cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact;
use crate::codec::{valid_iterations, DEFAULT_ITERATIONS};
use crate::edit::EditTransaction;
use crate::error::{RelicError, Result};
use crate::kdf::{KeyCache, MasterKey, SharedKeyCache};
use crate::tree::{self, EncryptedTree, PlainTree, SecretsTree};

/// Run CPU-bound crypto off the async runtime.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RelicError::Task(e.to_string()))?
}

#[derive(Debug, Clone)]
pub struct Engine {
    cache: SharedKeyCache,
    iterations: u32,
}

impl Engine {
    /// Create an engine around an existing cache.
    pub fn new(cache: SharedKeyCache) -> Self {
        Self {
            cache,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Set the iteration count used for new tokens.
    pub fn with_iterations(mut self, iterations: u32) -> Result<Self> {
        if !valid_iterations(iterations) {
            return Err(RelicError::Encrypt(format!(
                "iteration count {} is out of range",
                iterations
            )));
        }
        self.iterations = iterations;
        Ok(self)
    }

    pub fn cache(&self) -> &SharedKeyCache {
        &self.cache
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn encrypt_tree(&self, master_key: &MasterKey, tree: &PlainTree) -> Result<EncryptedTree> {
        tree::encrypt_tree(&self.cache, master_key, tree, self.iterations)
    }

    pub fn decrypt_tree(&self, master_key: &MasterKey, tree: &EncryptedTree) -> Result<PlainTree> {
        tree::decrypt_tree(&self.cache, master_key, tree)
    }

    /// Encrypt plaintext JSON into artifact text.
    ///
    /// `iterations` overrides the engine default for this call only.
    pub fn encrypt_artifact(
        &self,
        master_key: &MasterKey,
        plain_json: &str,
        iterations: Option<u32>,
    ) -> Result<String> {
        let plain = parse_plaintext(plain_json)?;
        let iterations = iterations.unwrap_or(self.iterations);
        let encrypted = tree::encrypt_tree(&self.cache, master_key, &plain, iterations)?;
        Ok(artifact::serialize(&encrypted))
    }

    /// Decrypt artifact text into pretty-printed plaintext JSON.
    pub fn decrypt_artifact(&self, master_key: &MasterKey, artifact_text: &str) -> Result<String> {
        let encrypted = artifact::parse(artifact_text)?;
        let plain = self.decrypt_tree(master_key, &encrypted)?;
        Ok(artifact::serialize(&plain))
    }

    /// Read and fully decrypt the artifact at `path`.
    pub async fn load_secrets(&self, master_key: &MasterKey, path: &Path) -> Result<PlainTree> {
        let text = artifact::load(path).await?;
        let encrypted = artifact::parse(&text)?;
        self.decrypt_tree_blocking(master_key, encrypted).await
    }

    /// Start an edit transaction against the artifact at `path`.
    pub fn edit(&self, master_key: MasterKey, path: impl Into<PathBuf>) -> EditTransaction {
        EditTransaction::new(self.clone(), master_key, path)
    }

    pub(crate) async fn decrypt_tree_blocking(
        &self,
        master_key: &MasterKey,
        tree: EncryptedTree,
    ) -> Result<PlainTree> {
        let cache = self.cache.clone();
        let master_key = master_key.clone();
        blocking(move || tree::decrypt_tree(&cache, &master_key, &tree)).await
    }

    pub(crate) async fn reencrypt_tree_blocking(
        &self,
        master_key: &MasterKey,
        edited: PlainTree,
        previous_plain: PlainTree,
        previous_encrypted: EncryptedTree,
        iterations: u32,
    ) -> Result<EncryptedTree> {
        let cache = self.cache.clone();
        let master_key = master_key.clone();
        blocking(move || {
            tree::reencrypt_tree(
                &cache,
                &master_key,
                &edited,
                &previous_plain,
                &previous_encrypted,
                iterations,
            )
        })
        .await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(KeyCache::new()))
    }
}

/// Parse plaintext JSON handed in by a caller or an editor.
pub(crate) fn parse_plaintext(text: &str) -> Result<SecretsTree> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RelicError::InvalidJson(format!("not valid JSON: {}", e)))?;
    let kind = artifact::json_kind(&value);
    SecretsTree::from_value(value).ok_or_else(|| {
        RelicError::InvalidJson(format!("top-level value must be an object, found {}", kind))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::is_encoded;
    use serde_json::{json, Value};

    fn engine() -> Engine {
        Engine::default().with_iterations(1_000).unwrap()
    }

    fn key(value: &str) -> MasterKey {
        MasterKey::new(value).unwrap()
    }

    #[test]
    fn test_encrypt_then_decrypt_artifact() {
        let engine = engine();
        let k = key("K");

        let artifact = engine
            .encrypt_artifact(&k, r#"{"API_KEY":"abc"}"#, None)
            .unwrap();
        assert!(artifact.ends_with("}\n"));

        let plain = engine.decrypt_artifact(&k, &artifact).unwrap();
        let value: Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(value, json!({"API_KEY": "abc"}));
    }

    #[test]
    fn test_other_key_is_rejected() {
        let engine = engine();
        let artifact = engine
            .encrypt_artifact(&key("K"), r#"{"API_KEY":"abc"}"#, None)
            .unwrap();

        assert!(matches!(
            engine.decrypt_artifact(&key("K2"), &artifact),
            Err(RelicError::DecryptFailed { ref path }) if path == "API_KEY"
        ));
    }

    #[test]
    fn test_every_leaf_rejects_a_wrong_key() {
        let engine = engine();
        let encrypted = engine
            .encrypt_tree(
                &key("K"),
                &SecretsTree::from_value(json!({"a": 1, "b": {"c": [true]}})).unwrap(),
            )
            .unwrap();

        for (name, node) in encrypted.iter() {
            let single: SecretsTree = [(name.to_string(), node.clone())].into_iter().collect();
            assert!(matches!(
                engine.decrypt_tree(&key("K2"), &single),
                Err(RelicError::DecryptFailed { .. })
            ));
        }
    }

    #[test]
    fn test_iterations_override_is_recorded_in_tokens() {
        let engine = engine();
        let artifact = engine
            .encrypt_artifact(&key("K"), r#"{"x": 1}"#, Some(7))
            .unwrap();
        let parsed = artifact::parse(&artifact).unwrap();
        let token = parsed.get("x").and_then(|n| n.as_leaf()).and_then(Value::as_str).unwrap();
        assert!(is_encoded(token));

        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD.decode(&token["relic:v1:".len()..]).unwrap();
        assert_eq!(&bytes[..4], &7u32.to_be_bytes());
    }

    #[test]
    fn test_plaintext_must_be_an_object() {
        let engine = engine();
        assert!(matches!(
            engine.encrypt_artifact(&key("K"), "[1,2]", None),
            Err(RelicError::InvalidJson(_))
        ));
        assert!(matches!(
            engine.encrypt_artifact(&key("K"), "{", None),
            Err(RelicError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_out_of_range_iterations_rejected() {
        assert!(Engine::default().with_iterations(0).is_err());
    }

    #[tokio::test]
    async fn test_load_secrets() {
        let engine = engine();
        let k = key("K");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relic.json");

        let text = engine
            .encrypt_artifact(&k, r#"{"db": {"password": "pw", "port": 5432}}"#, None)
            .unwrap();
        artifact::store(&path, &text).await.unwrap();

        let secrets = engine.load_secrets(&k, &path).await.unwrap();
        assert_eq!(
            secrets.get("db.password").and_then(|n| n.as_leaf()),
            Some(&json!("pw"))
        );
        assert_eq!(
            secrets.get("db.port").and_then(|n| n.as_leaf()),
            Some(&json!(5432))
        );
    }

    #[tokio::test]
    async fn test_load_secrets_missing_file() {
        let engine = engine();
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            engine.load_secrets(&key("K"), &dir.path().join("nope.json")).await,
            Err(RelicError::MissingArtifact(_))
        ));
    }
}
