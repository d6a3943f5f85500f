//! Master keys and the PBKDF2 derivation cache.
//!
//! Deriving a leaf key is deliberately expensive, so derived keys are memoized
//! on `(sha256(master key), salt, iterations)`. The cache is an explicit object
//! that the host shares by `Arc`; nothing here is process-global.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::RelicError;

/// Derived key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 16;

/// Length of a generated master key before hex encoding
const GENERATED_KEY_BYTES: usize = 32;

/// The secret string every leaf key is stretched from.
///
/// The value is zeroized on drop and never shown by `Debug`.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<String>);

impl MasterKey {
    /// Wrap a master key. Blank keys are rejected.
    pub fn new(value: impl Into<String>) -> Result<Self, RelicError> {
        let value = Zeroizing::new(value.into());
        if value.trim().is_empty() {
            return Err(RelicError::MissingMasterKey);
        }
        Ok(Self(value))
    }

    /// Generate a fresh random master key (64 hex characters).
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; GENERATED_KEY_BYTES]);
        rand::thread_rng().fill_bytes(&mut *bytes);
        Self(Zeroizing::new(hex::encode(&bytes[..])))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// A 256-bit key derived from a master key. Cheap to clone.
#[derive(Clone)]
pub struct DerivedKey(Arc<Zeroizing<[u8; KEY_LENGTH]>>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Run PBKDF2-HMAC-SHA256 once.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> DerivedKey {
    let mut output = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut *output);
    DerivedKey(Arc::new(output))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    master_digest: [u8; 32],
    salt: [u8; SALT_LENGTH],
    iterations: u32,
}

/// A slot is inserted before the derivation runs, so concurrent callers for
/// the same tuple block on the same `OnceLock` instead of deriving twice.
type Slot = Arc<OnceLock<DerivedKey>>;

#[derive(Default)]
struct Entries {
    slots: HashMap<CacheKey, Slot>,
    /// Insertion order, oldest first. Only maintained when capped.
    order: VecDeque<CacheKey>,
}

/// Hit/miss counters for a [`KeyCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizing PBKDF2 key derivation.
pub struct KeyCache {
    entries: Mutex<Entries>,
    capacity: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KeyCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache holding at most `capacity` keys; the oldest entry is
    /// evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::new()
        }
    }

    /// Derive (or fetch) the key for `(master_key, salt, iterations)`.
    pub fn derive(
        &self,
        master_key: &MasterKey,
        salt: &[u8; SALT_LENGTH],
        iterations: u32,
    ) -> DerivedKey {
        let key = CacheKey {
            master_digest: master_key.digest(),
            salt: *salt,
            iterations,
        };
        let slot = self.slot(key);

        let mut derived_here = false;
        let derived = slot
            .get_or_init(|| {
                derived_here = true;
                pbkdf2_sha256(master_key.expose().as_bytes(), salt, iterations)
            })
            .clone();

        if derived_here {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(iterations, "Derived leaf key");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        derived
    }

    fn slot(&self, key: CacheKey) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = entries.slots.get(&key) {
            return slot.clone();
        }

        if let Some(capacity) = self.capacity {
            while entries.slots.len() >= capacity {
                match entries.order.pop_front() {
                    Some(oldest) => {
                        entries.slots.remove(&oldest);
                    }
                    None => break,
                }
            }
            entries.order.push_back(key.clone());
        }

        let slot = Slot::default();
        entries.slots.insert(key, slot.clone());
        slot
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.slots.clear();
        entries.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Shared key cache handle.
pub type SharedKeyCache = Arc<KeyCache>;
