//! # relic
//!
//! Encrypted secrets artifacts that live in version control.
//!
//! Every leaf of a JSON secrets tree is encrypted individually with
//! AES-256-GCM under a key derived from a master key with PBKDF2-HMAC-SHA256,
//! while the object structure and key names stay readable. Diffs of the
//! artifact therefore show which secrets changed without revealing them.
//!
//! ## Architecture
//!
//! ```text
//!   EditTransaction ──▶ Engine ──▶ tree walker ──▶ codec ──▶ KeyCache
//!         │                              │
//!         └──────────▶ artifact ◀────────┘
//!                   (parse / serialize / atomic store)
//! ```
//!
//! ## Modules
//! - `codec`: single-leaf token encoding and decoding
//! - `kdf`: master keys, derived keys and the shared derivation cache
//! - `tree`: structure-preserving parallel walks over secrets trees
//! - `artifact`: canonical artifact text and on-disk persistence
//! - `edit`: the decrypt-edit-validate-encrypt transaction
//! - `engine`: the programmatic surface tying the above together
//! - `config`: environment configuration and master key resolution

pub mod artifact;
pub mod codec;
pub mod config;
pub mod edit;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod tree;

pub use config::Config;
pub use edit::{AbortReason, CommandEditor, EditOutcome, EditState, EditTransaction, EditorInvoker};
pub use engine::Engine;
pub use error::{RelicError, Result};
pub use kdf::{KeyCache, MasterKey};
pub use tree::{Node, SecretsTree};
