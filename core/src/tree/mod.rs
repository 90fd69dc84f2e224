//! Copy-on-write B+trees persisted as immutable, reference-counted nodes.

mod forest;
mod node;

pub use forest::{Forest, TreeRecord};
pub use node::{KEY_LEN, Key, Node, NodeId};
