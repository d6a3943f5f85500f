//! Artifact text format and on-disk persistence.
//!
//! The artifact is pretty-printed JSON (2-space indent, insertion order,
//! trailing newline) so that version-control diffs stay minimal and stable.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{RelicError, Result};
use crate::tree::SecretsTree;

/// Human-readable name of a JSON value's type, for error messages.
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Render a tree as canonical artifact text.
pub fn serialize(tree: &SecretsTree) -> String {
    format!("{:#}\n", tree.to_value())
}

/// Parse artifact text. The top-level value must be a JSON object.
pub fn parse(text: &str) -> Result<SecretsTree> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelicError::InvalidFormat(format!("not valid JSON: {}", e)))?;
    let kind = json_kind(&value);
    SecretsTree::from_value(value).ok_or_else(|| {
        RelicError::InvalidFormat(format!("top-level value must be an object, found {}", kind))
    })
}

/// Read artifact text from disk.
pub async fn load(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RelicError::MissingArtifact(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Unique hidden sibling of `path` to stage a replacement in. Never equal to
/// `path` and never an existing file.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

/// Replace the artifact at `path` with `text` atomically.
///
/// The full text goes to a freshly created sibling staging file which is
/// flushed to disk and then renamed over the target, so readers see either the
/// old or the new artifact, never a partial write.
pub async fn store(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = staging_path(path);
    let staged = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = staged {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove staging file {}: {}",
                    tmp_path.display(),
                    cleanup
                );
            }
        }
        return Err(e.into());
    }

    tracing::debug!("Wrote artifact to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_is_pretty_with_trailing_newline() {
        let tree = SecretsTree::from_value(json!({"b": {"c": 1}, "a": "x"})).unwrap();
        assert_eq!(
            serialize(&tree),
            "{\n  \"b\": {\n    \"c\": 1\n  },\n  \"a\": \"x\"\n}\n"
        );
    }

    #[test]
    fn test_serialize_empty() {
        assert_eq!(serialize(&SecretsTree::new()), "{}\n");
    }

    #[test]
    fn test_parse_then_serialize_is_stable() {
        let text = "{\n  \"zeta\": \"relic:v1:AAAA\",\n  \"alpha\": {\n    \"k\": null\n  }\n}\n";
        assert_eq!(serialize(&parse(text).unwrap()), text);
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(parse("{not json"), Err(RelicError::InvalidFormat(_))));
        assert!(matches!(parse(""), Err(RelicError::InvalidFormat(_))));
    }

    #[test]
    fn test_parse_rejects_non_object_root() {
        for text in ["[1, 2]", "\"relic:v1:abc\"", "42", "null", "true"] {
            match parse(text) {
                Err(RelicError::InvalidFormat(detail)) => {
                    assert!(detail.contains("top-level"), "{}", detail)
                }
                other => panic!("{} parsed as {:?}", text, other),
            }
        }
    }

    #[tokio::test]
    async fn test_load_missing_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        assert!(matches!(
            load(&path).await,
            Err(RelicError::MissingArtifact(p)) if p == path
        ));
    }

    #[tokio::test]
    async fn test_store_replaces_contents_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config").join("relic.json");

        store(&path, "{\n  \"a\": 1\n}\n").await.unwrap();
        store(&path, "{}\n").await.unwrap();

        assert_eq!(load(&path).await.unwrap(), "{}\n");
        assert_eq!(dir_entries(path.parent().unwrap()), ["relic.json"]);
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_store_leaves_unrelated_tmp_sibling_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relic.json");
        let sibling = dir.path().join("relic.tmp");
        std::fs::write(&sibling, "notes").unwrap();

        store(&path, "{}\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&sibling).unwrap(), "notes");
        assert_eq!(load(&path).await.unwrap(), "{}\n");
        assert_eq!(dir_entries(dir.path()), ["relic.json", "relic.tmp"]);
    }

    #[tokio::test]
    async fn test_store_artifact_with_tmp_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.tmp");
        assert_ne!(staging_path(&path), path);

        store(&path, "{\n  \"a\": 1\n}\n").await.unwrap();
        store(&path, "{}\n").await.unwrap();

        assert_eq!(load(&path).await.unwrap(), "{}\n");
        assert_eq!(dir_entries(dir.path()), ["secrets.tmp"]);
    }

    #[test]
    fn test_staging_paths_are_unique_hidden_siblings() {
        let path = Path::new("config/relic.json");
        let a = staging_path(path);
        let b = staging_path(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".relic.json."));
        assert!(name.ends_with(".tmp"));
    }
}
