use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::Result;

/// Transformation applied to every file the repository stores, keyed by the
/// toplevel directory the file lives in.
pub trait DataFilter: Send + Sync {
    fn name(&self) -> &str;

    fn filter_write(&self, data: Vec<u8>, toplevel: &str) -> Result<Vec<u8>>;

    fn filter_read(&self, data: Vec<u8>, toplevel: &str) -> Result<Vec<u8>>;
}

pub type NameHook = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Extension points of a repository: data filters, add-client handlers and
/// toplevel-init handlers. Filters run in registration order on write and in
/// reverse order on read.
#[derive(Clone, Default)]
pub struct Hooks {
    filters: Vec<Arc<dyn DataFilter>>,
    add_client: Vec<NameHook>,
    toplevel_init: Vec<NameHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl DataFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn on_add_client<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.add_client.push(Arc::new(callback));
        self
    }

    pub fn on_toplevel_init<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.toplevel_init.push(Arc::new(callback));
        self
    }

    pub fn filter_write(&self, mut data: Vec<u8>, toplevel: &str) -> Result<Vec<u8>> {
        for filter in &self.filters {
            data = filter.filter_write(data, toplevel)?;
        }
        Ok(data)
    }

    pub fn filter_read(&self, mut data: Vec<u8>, toplevel: &str) -> Result<Vec<u8>> {
        for filter in self.filters.iter().rev() {
            data = filter.filter_read(data, toplevel)?;
        }
        Ok(data)
    }

    pub fn client_added(&self, client: &str) -> Result<()> {
        for callback in &self.add_client {
            callback(client)?;
        }
        Ok(())
    }

    pub fn toplevel_initialized(&self, toplevel: &str) -> Result<()> {
        for callback in &self.toplevel_init {
            callback(toplevel)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "filters",
                &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("add_client", &self.add_client.len())
            .field("toplevel_init", &self.toplevel_init.len())
            .finish()
    }
}

const ZLIB_TAG: &[u8] = b"zlib\0";

/// zlib compression. Data without the tag is passed through on read, so a
/// repository can enable compression after the fact.
#[derive(Debug, Clone)]
pub struct CompressionFilter {
    level: Compression,
}

impl CompressionFilter {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for CompressionFilter {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl DataFilter for CompressionFilter {
    fn name(&self) -> &str {
        "compression"
    }

    fn filter_write(&self, data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(ZLIB_TAG.to_vec(), self.level);
        encoder.write_all(&data)?;
        Ok(encoder.finish()?)
    }

    fn filter_read(&self, data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
        match data.strip_prefix(ZLIB_TAG) {
            Some(compressed) => {
                let mut plain = Vec::new();
                ZlibDecoder::new(compressed).read_to_end(&mut plain)?;
                Ok(plain)
            }
            None => Ok(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Tagger(&'static str);

    impl DataFilter for Tagger {
        fn name(&self) -> &str {
            self.0
        }

        fn filter_write(&self, mut data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
            data.extend_from_slice(self.0.as_bytes());
            Ok(data)
        }

        fn filter_read(&self, mut data: Vec<u8>, _toplevel: &str) -> Result<Vec<u8>> {
            assert!(data.ends_with(self.0.as_bytes()));
            data.truncate(data.len() - self.0.len());
            Ok(data)
        }
    }

    #[test]
    fn test_filters_apply_in_order_and_reverse() {
        let hooks = Hooks::new().with_filter(Tagger("A")).with_filter(Tagger("B"));
        let stored = hooks.filter_write(b"x".to_vec(), "chunks").unwrap();
        assert_eq!(stored, b"xAB");
        assert_eq!(hooks.filter_read(stored, "chunks").unwrap(), b"x");
    }

    #[test]
    fn test_compression_passes_untagged_data() {
        let filter = CompressionFilter::default();
        let data = vec![7u8; 4096];
        let stored = filter.filter_write(data.clone(), "chunks").unwrap();
        assert!(stored.len() < data.len());
        assert_eq!(filter.filter_read(stored, "chunks").unwrap(), data);
        assert_eq!(filter.filter_read(b"raw".to_vec(), "chunks").unwrap(), b"raw");
    }

    #[test]
    fn test_add_client_hooks_see_names() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = Hooks::new().on_add_client(move |name| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });
        hooks.client_added("alice").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["alice"]);
    }
}
