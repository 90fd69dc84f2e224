pub mod backend;
pub mod chunk_index;
pub mod chunk_store;
pub mod chunker;
pub mod client_list;
pub mod client_tree;
pub mod crypto;
pub mod error;
pub mod forget;
pub mod fsck;
pub mod hooks;
pub mod lock;
pub mod memory;
pub mod metadata;
pub mod owner;
pub mod repo_fs;
pub mod repository;
pub mod tree;
pub mod types;

pub use backend::{Backend, BackendType};
pub use crypto::{EncryptionConfig, EncryptionFilter};
pub use error::{Error, Result};
pub use forget::{ForgetPlan, RetentionPolicy};
pub use fsck::{Fsck, FsckReport, FsckSettings};
pub use hooks::{CompressionFilter, DataFilter, Hooks};
pub use memory::MemoryBackend;
pub use metadata::{FileKey, FileKind, GenerationKey, KeyValue, Metadata};
pub use owner::OwnerCache;
pub use repository::Repository;
pub use types::*;
