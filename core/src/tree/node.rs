use serde::{Deserialize, Serialize};
use std::fmt;

pub const KEY_LEN: usize = 18;

pub type NodeId = u64;

/// Fixed-size tree key: `prefix(1) | main(8) | subtype(1) | subkey(8)`,
/// all big-endian so byte order equals numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn new(prefix: u8, main: u64, subtype: u8, subkey: u64) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes[0] = prefix;
        bytes[1..9].copy_from_slice(&main.to_be_bytes());
        bytes[9] = subtype;
        bytes[10..18].copy_from_slice(&subkey.to_be_bytes());
        Self(bytes)
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn main(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[1..9]);
        u64::from_be_bytes(buf)
    }

    pub fn subtype(&self) -> u8 {
        self.0[9]
    }

    pub fn subkey(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[10..18]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Key({}:{:016x}:{}:{:016x})",
            self.prefix(),
            self.main(),
            self.subtype(),
            self.subkey()
        )
    }
}

/// A tree node. Index nodes hold the lower bound key of each child; the first
/// bound may be lower than the child's actual minimum after removals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        entries: Vec<(Key, Vec<u8>)>,
    },
    Index {
        keys: Vec<Key>,
        children: Vec<NodeId>,
    },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Index { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_key(&self) -> Option<Key> {
        match self {
            Node::Leaf { entries } => entries.first().map(|(k, _)| *k),
            Node::Index { keys, .. } => keys.first().copied(),
        }
    }

    /// Index of the child whose key range may contain `key`, or `None` if
    /// `key` sorts before every child.
    pub fn child_slot(keys: &[Key], key: &Key) -> Option<usize> {
        match keys.binary_search(key) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Split off the upper half into a new node. Returns the new node and its first key.
    pub fn split(&mut self) -> (Key, Node) {
        match self {
            Node::Leaf { entries } => {
                let upper = entries.split_off(entries.len() / 2);
                let first = upper[0].0;
                (first, Node::Leaf { entries: upper })
            }
            Node::Index { keys, children } => {
                let at = keys.len() / 2;
                let upper_keys = keys.split_off(at);
                let upper_children = children.split_off(at);
                let first = upper_keys[0];
                (
                    first,
                    Node::Index {
                        keys: upper_keys,
                        children: upper_children,
                    },
                )
            }
        }
    }
}
