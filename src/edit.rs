//! Read-modify-write edit transaction.
//!
//! ```text
//! Idle ──load──▶ Loaded ──materialize──▶ Editing ──editor exits──▶ Validating
//!                                                                      │
//!                                        Aborted ◀──invalid / failed───┤
//!                                        Committed ◀──re-encrypt+swap──┘
//! ```
//!
//! The artifact on disk is only ever replaced by a complete, validated,
//! re-encrypted tree, via an atomic rename. The plaintext scratch file lives in
//! a drop guard, so it is removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact;
use crate::codec::valid_iterations;
use crate::engine::{parse_plaintext, Engine};
use crate::error::{RelicError, Result};
use crate::kdf::MasterKey;
use crate::tree::{EncryptedTree, PlainTree};

/// Transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Loaded,
    Editing,
    Validating,
    Committed,
    Aborted,
}

/// Why a transaction ended without touching the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("Editor failed: {0}")]
    Editor(String),

    #[error("Edited content is not a JSON object: {0}")]
    InvalidJson(String),
}

/// Result of a transaction that got as far as the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The artifact was rewritten.
    Committed { leaves: usize },
    /// The edited tree matched the loaded one; the artifact was left as is.
    Unchanged,
    /// Validation or the editor failed; the artifact was left as is.
    Aborted(AbortReason),
}

/// Errors from launching an external editor.
#[derive(Debug, Error)]
pub enum EditorError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    ExitStatus { program: String, status: ExitStatus },
}

/// Something that lets a human edit a file in place and returns once done.
#[async_trait]
pub trait EditorInvoker: Send + Sync {
    async fn edit(&self, path: &Path) -> std::result::Result<(), EditorError>;
}

/// Spawns an editor process with the file path as its last argument.
#[derive(Debug, Clone)]
pub struct CommandEditor {
    program: String,
    args: Vec<String>,
}

/// Fallback when neither `VISUAL` nor `EDITOR` is set
pub const DEFAULT_EDITOR: &str = "vi";

impl CommandEditor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split an editor command line such as `code --wait` into program and
    /// leading arguments. Returns `None` for a blank command.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl EditorInvoker for CommandEditor {
    async fn edit(&self, path: &Path) -> std::result::Result<(), EditorError> {
        debug!("Launching editor '{}'", self.program);
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .status()
            .await
            .map_err(|source| EditorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(EditorError::ExitStatus {
                program: self.program.clone(),
                status,
            })
        }
    }
}

/// Plaintext scratch file (removed on drop).
struct PlaintextFile {
    path: PathBuf,
}

impl PlaintextFile {
    async fn create(dir: &Path, contents: &str) -> std::io::Result<Self> {
        let path = dir.join(format!("relic-edit-{}.json", Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path).await?;
        let guard = Self { path };
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(guard)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

impl Drop for PlaintextFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed plaintext scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove plaintext scratch file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// The decrypted artifact as loaded, kept to detect unchanged leaves.
struct Snapshot {
    plain: PlainTree,
    encrypted: EncryptedTree,
}

/// One edit of one artifact. Assumes a single writer per artifact path;
/// concurrent transactions on the same file are not coordinated.
pub struct EditTransaction {
    engine: Engine,
    master_key: MasterKey,
    artifact_path: PathBuf,
    iterations: u32,
    scratch_dir: PathBuf,
    state: EditState,
}

impl EditTransaction {
    pub fn new(engine: Engine, master_key: MasterKey, artifact_path: impl Into<PathBuf>) -> Self {
        let iterations = engine.iterations();
        Self {
            engine,
            master_key,
            artifact_path: artifact_path.into(),
            iterations,
            scratch_dir: std::env::temp_dir(),
            state: EditState::Idle,
        }
    }

    /// Iteration count for leaves re-encrypted by this transaction. Counts
    /// outside the accepted range are rejected immediately.
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

    /// Directory for the plaintext scratch file (defaults to the system temp
    /// directory).
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    fn transition(&mut self, next: EditState) {
        debug!(from = ?self.state, to = ?next, "Edit transaction state change");
        self.state = next;
    }

    /// Run the transaction to completion.
    ///
    /// Failures before the editor runs (missing key, undecryptable artifact,
    /// I/O) are errors. Editor and validation failures are
    /// [`EditOutcome::Aborted`]. In both cases the artifact is untouched.
    pub async fn run(&mut self, editor: &dyn EditorInvoker) -> Result<EditOutcome> {
        let result = self.execute(editor).await;
        let last = match &result {
            Ok(EditOutcome::Committed { .. }) | Ok(EditOutcome::Unchanged) => EditState::Committed,
            Ok(EditOutcome::Aborted(reason)) => {
                warn!("Edit aborted, artifact left unchanged: {}", reason);
                EditState::Aborted
            }
            Err(e) => {
                warn!("Edit failed, artifact left unchanged: {}", e);
                EditState::Aborted
            }
        };
        self.transition(last);
        result
    }

    async fn execute(&mut self, editor: &dyn EditorInvoker) -> Result<EditOutcome> {
        let snapshot = self.load().await?;
        self.transition(EditState::Loaded);

        let scratch =
            PlaintextFile::create(&self.scratch_dir, &artifact::serialize(&snapshot.plain))
                .await?;
        self.transition(EditState::Editing);

        if let Err(e) = editor.edit(scratch.path()).await {
            return Ok(EditOutcome::Aborted(AbortReason::Editor(e.to_string())));
        }
        self.transition(EditState::Validating);

        let edited_text = match String::from_utf8(scratch.read().await?) {
            Ok(text) => text,
            Err(e) => {
                return Ok(EditOutcome::Aborted(AbortReason::InvalidJson(format!(
                    "not valid UTF-8: {}",
                    e.utf8_error()
                ))))
            }
        };
        let edited = match parse_plaintext(&edited_text) {
            Ok(tree) => tree,
            Err(RelicError::InvalidJson(detail)) => {
                return Ok(EditOutcome::Aborted(AbortReason::InvalidJson(detail)))
            }
            Err(e) => return Err(e),
        };

        if edited == snapshot.plain {
            info!("No changes to {}", self.artifact_path.display());
            return Ok(EditOutcome::Unchanged);
        }

        let leaves = edited.leaf_count();
        let encrypted = self
            .engine
            .reencrypt_tree_blocking(
                &self.master_key,
                edited,
                snapshot.plain,
                snapshot.encrypted,
                self.iterations,
            )
            .await?;
        artifact::store(&self.artifact_path, &artifact::serialize(&encrypted)).await?;
        info!(
            "Saved {} encrypted values to {}",
            leaves,
            self.artifact_path.display()
        );

        drop(scratch);
        Ok(EditOutcome::Committed { leaves })
    }

    async fn load(&self) -> Result<Snapshot> {
        let text = match artifact::load(&self.artifact_path).await {
            Ok(text) => text,
            Err(RelicError::MissingArtifact(_)) => {
                debug!(
                    "No artifact at {}, starting from an empty tree",
                    self.artifact_path.display()
                );
                return Ok(Snapshot {
                    plain: PlainTree::new(),
                    encrypted: EncryptedTree::new(),
                });
            }
            Err(e) => return Err(e),
        };

        let encrypted = artifact::parse(&text)?;
        let plain = self
            .engine
            .decrypt_tree_blocking(&self.master_key, encrypted.clone())
            .await?;
        Ok(Snapshot { plain, encrypted })
    }
}
