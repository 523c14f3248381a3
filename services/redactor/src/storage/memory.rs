use super::{ByteRange, ContentRange, ListPage, ObjectBody, ObjectStore, StorageObjectRef};
use crate::error::{Error, Resource, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

const DEFAULT_PAGE_SIZE: usize = 1000;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-process object store.
///
/// Listing is paginated like a remote store so callers exercise the same
/// continuation logic; bodies are streamed in fixed-size chunks.
#[derive(Debug)]
pub struct MemoryStore {
    containers: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    fn lookup(&self, object: &StorageObjectRef) -> Result<StoredObject> {
        let containers = self.containers.read();
        containers
            .get(&object.container)
            .and_then(|objects| objects.get(&object.name))
            .cloned()
            .ok_or_else(|| Error::object_not_found(&object.container, &object.name))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        self.containers
            .write()
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn put(&self, object: &StorageObjectRef, data: Bytes, content_type: &str) -> Result<()> {
        let mut containers = self.containers.write();
        let objects = containers.get_mut(&object.container).ok_or_else(|| {
            Error::NotFound(Resource::Container {
                container: object.container.clone(),
            })
        })?;

        objects.insert(
            object.name.clone(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let containers = self.containers.read();
        let objects = containers.get(container).ok_or_else(|| {
            Error::NotFound(Resource::Container {
                container: container.to_string(),
            })
        })?;

        let lower = match continuation {
            Some(ref token) => Bound::Excluded(token.clone()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range((lower, Bound::Unbounded))
            .map(|(name, _)| name)
            .take_while(|name| name.starts_with(prefix));

        let names: Vec<String> = matching
            .by_ref()
            .take(self.page_size)
            .cloned()
            .collect();

        let continuation = match (names.last(), matching.next()) {
            (Some(last), Some(_)) => Some(last.clone()),
            _ => None,
        };

        Ok(ListPage {
            names,
            continuation,
        })
    }

    async fn get(&self, object: &StorageObjectRef, range: Option<ByteRange>) -> Result<ObjectBody> {
        let StoredObject { data, content_type } = self.lookup(object)?;
        let total = data.len() as u64;

        let (data, content_range) = match range {
            Some(range) => {
                let (start, end) = range.resolve(total).ok_or_else(|| Error::InvalidRange {
                    range: range.to_string(),
                })?;
                (
                    data.slice(start as usize..=end as usize),
                    Some(ContentRange { start, end, total }),
                )
            }
            None => (data, None),
        };

        let content_length = data.len() as u64;
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(CHUNK_SIZE)
            .map(|offset| Ok(data.slice(offset..(offset + CHUNK_SIZE).min(data.len()))))
            .collect();

        Ok(ObjectBody {
            stream: Box::pin(futures::stream::iter(chunks)),
            content_length,
            content_range,
            content_type: Some(content_type),
        })
    }

    async fn exists(&self, object: &StorageObjectRef) -> Result<bool> {
        Ok(self.lookup(object).is_ok())
    }
}
