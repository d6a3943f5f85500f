//! The secrets tree and the structure-preserving encrypt/decrypt walks.
//!
//! JSON objects become [`Node::Branch`] and everything else becomes
//! [`Node::Leaf`] once, at conversion time. The walks then transform leaves
//! and recurse into branches, keeping key order and shape intact. Siblings are
//! processed on the rayon pool; results are collected by position, so the
//! output order is always the input order.

use rayon::prelude::*;
use serde_json::{Map, Value};

use crate::codec::{decode_leaf, encode_leaf, is_encoded};
use crate::error::Result;
use crate::kdf::{KeyCache, MasterKey};

/// A value in a [`SecretsTree`].
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Scalar or array. Encrypted as a single unit.
    Leaf(Value),
    /// Nested mapping. Never encrypted itself.
    Branch(SecretsTree),
}

impl Node {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Node::Branch(SecretsTree::from_map(map)),
            other => Node::Leaf(other),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Node::Leaf(value) => value.clone(),
            Node::Branch(tree) => tree.to_value(),
        }
    }

    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Node::Leaf(value) => Some(value),
            Node::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&SecretsTree> {
        match self {
            Node::Branch(tree) => Some(tree),
            Node::Leaf(_) => None,
        }
    }
}

/// Ordered mapping from key to [`Node`]. Keys are unique; order is insertion
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SecretsTree {
    entries: Vec<(String, Node)>,
}

/// Encrypted and plaintext trees share a representation; the aliases document
/// which one a function expects.
pub type EncryptedTree = SecretsTree;
pub type PlainTree = SecretsTree;

impl SecretsTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a JSON value into a tree. Returns `None` unless the value is an
    /// object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::from_map(map)),
            _ => None,
        }
    }

    fn from_map(map: Map<String, Value>) -> Self {
        Self {
            entries: map
                .into_iter()
                .map(|(key, value)| (key, Node::from_value(value)))
                .collect(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(key, node)| (key.clone(), node.to_value()))
                .collect(),
        )
    }

    /// Insert or replace `key`. A replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, node: Node) -> Option<Node> {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, node)),
            None => {
                self.entries.push((key, node));
                None
            }
        }
    }

    /// Direct child lookup.
    pub fn entry(&self, key: &str) -> Option<&Node> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, node)| node)
    }

    /// Look up a dotted key path such as `database.password`.
    pub fn get(&self, path: &str) -> Option<&Node> {
        let mut segments = path.split('.');
        let mut node = self.entry(segments.next()?)?;
        for segment in segments {
            node = node.as_branch()?.entry(segment)?;
        }
        Some(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(key, node)| (key.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of leaves at any depth.
    pub fn leaf_count(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, node)| match node {
                Node::Leaf(_) => 1,
                Node::Branch(tree) => tree.leaf_count(),
            })
            .sum()
    }
}

impl FromIterator<(String, Node)> for SecretsTree {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        let mut tree = SecretsTree::new();
        for (key, node) in iter {
            tree.insert(key, node);
        }
        tree
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

struct Walker<'a> {
    cache: &'a KeyCache,
    master_key: &'a MasterKey,
    iterations: u32,
}

impl Walker<'_> {
    fn encrypt(&self, tree: &SecretsTree, prefix: &str) -> Result<SecretsTree> {
        let entries = tree
            .entries
            .par_iter()
            .map(|(key, node)| -> Result<(String, Node)> {
                let path = child_path(prefix, key);
                let node = match node {
                    Node::Branch(sub) => Node::Branch(self.encrypt(sub, &path)?),
                    Node::Leaf(value) => Node::Leaf(Value::String(
                        encode_leaf(self.cache, self.master_key, value, self.iterations)
                            .map_err(|e| e.at(&path))?,
                    )),
                };
                Ok((key.clone(), node))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SecretsTree { entries })
    }

    fn decrypt(&self, tree: &SecretsTree, prefix: &str) -> Result<SecretsTree> {
        let entries = tree
            .entries
            .par_iter()
            .map(|(key, node)| -> Result<(String, Node)> {
                let path = child_path(prefix, key);
                let node = match node {
                    Node::Branch(sub) => Node::Branch(self.decrypt(sub, &path)?),
                    Node::Leaf(Value::String(token)) if is_encoded(token) => Node::Leaf(
                        decode_leaf(self.cache, self.master_key, token)
                            .map_err(|e| e.at(&path))?,
                    ),
                    Node::Leaf(plain) => Node::Leaf(plain.clone()),
                };
                Ok((key.clone(), node))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SecretsTree { entries })
    }

    fn reencrypt(
        &self,
        edited: &SecretsTree,
        previous_plain: Option<&SecretsTree>,
        previous_encrypted: Option<&SecretsTree>,
        prefix: &str,
    ) -> Result<SecretsTree> {
        let entries = edited
            .entries
            .par_iter()
            .map(|(key, node)| -> Result<(String, Node)> {
                let path = child_path(prefix, key);
                let old_plain = previous_plain.and_then(|t| t.entry(key));
                let old_encrypted = previous_encrypted.and_then(|t| t.entry(key));

                let node = match node {
                    Node::Branch(sub) => Node::Branch(self.reencrypt(
                        sub,
                        old_plain.and_then(Node::as_branch),
                        old_encrypted.and_then(Node::as_branch),
                        &path,
                    )?),
                    Node::Leaf(value) => match (old_plain, old_encrypted) {
                        (Some(Node::Leaf(before)), Some(Node::Leaf(Value::String(token))))
                            if before == value && is_encoded(token) =>
                        {
                            Node::Leaf(Value::String(token.clone()))
                        }
                        _ => Node::Leaf(Value::String(
                            encode_leaf(self.cache, self.master_key, value, self.iterations)
                                .map_err(|e| e.at(&path))?,
                        )),
                    },
                };
                Ok((key.clone(), node))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SecretsTree { entries })
    }
}

/// Encrypt every leaf of `tree`.
pub fn encrypt_tree(
    cache: &KeyCache,
    master_key: &MasterKey,
    tree: &PlainTree,
    iterations: u32,
) -> Result<EncryptedTree> {
    Walker {
        cache,
        master_key,
        iterations,
    }
    .encrypt(tree, "")
}

/// Decrypt every token in `tree`. Plaintext leaves pass through unchanged.
///
/// Fails closed: the first leaf that does not decrypt aborts the whole walk and
/// no partial tree is returned.
pub fn decrypt_tree(
    cache: &KeyCache,
    master_key: &MasterKey,
    tree: &EncryptedTree,
) -> Result<PlainTree> {
    Walker {
        cache,
        master_key,
        iterations: 0,
    }
    .decrypt(tree, "")
}

/// Encrypt `edited`, keeping the previous token for every leaf whose value and
/// position are unchanged since `previous_plain` was decrypted from
/// `previous_encrypted`. Unchanged keys therefore produce no diff.
pub fn reencrypt_tree(
    cache: &KeyCache,
    master_key: &MasterKey,
    edited: &PlainTree,
    previous_plain: &PlainTree,
    previous_encrypted: &EncryptedTree,
    iterations: u32,
) -> Result<EncryptedTree> {
    Walker {
        cache,
        master_key,
        iterations,
    }
    .reencrypt(edited, Some(previous_plain), Some(previous_encrypted), "")
}
