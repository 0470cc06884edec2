use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Persistent state store backed by SlateDB on a local filesystem, or by an
/// ordered in-memory map for tests and throwaway runs.
#[derive(Clone)]
pub struct StateStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Slate(Db),
    Memory(Arc<RwLock<BTreeMap<String, Vec<u8>>>>),
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            backend: Backend::Slate(db),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(BTreeMap::new()))),
        }
    }

    /// Store a value under the given key.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Slate(db) => db
                .put(key.as_bytes(), value)
                .await
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e)),
            Backend::Memory(map) => {
                map.write().await.insert(key.to_string(), value.to_vec());
                Ok(())
            }
        }
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Slate(db) => match db.get(key.as_bytes()).await {
                Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
                Ok(None) => Ok(None),
                Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
            },
            Backend::Memory(map) => Ok(map.read().await.get(key).cloned()),
        }
    }

    /// Delete a key from the store.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Slate(db) => db
                .delete(key.as_bytes())
                .await
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e)),
            Backend::Memory(map) => {
                map.write().await.remove(key);
                Ok(())
            }
        }
    }

    /// List all key-value pairs whose keys start with `prefix`, in key order.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        match &self.backend {
            Backend::Slate(db) => {
                let mut results = Vec::new();
                let mut iter = db
                    .scan_prefix(prefix.as_bytes())
                    .await
                    .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

                while let Ok(Some(kv)) = iter.next().await {
                    let key = String::from_utf8_lossy(&kv.key).to_string();
                    results.push((key, kv.value.to_vec()));
                }
                Ok(results)
            }
            Backend::Memory(map) => Ok(map
                .read()
                .await
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
        }
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        match self.backend {
            Backend::Slate(db) => {
                info!("Closing SlateDB state store");
                db.close()
                    .await
                    .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
            }
            Backend::Memory(_) => Ok(()),
        }
    }
}
