//! Contract of the document store used as a signaling medium.
//!
//! A store holds containers, each described by a free-form description and a set of named
//! files. Room documents are files of a single container shared by all peers.

use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reference to a file stored in a container. Its content is fetched separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub raw_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: HashMap<String, FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
}

impl FileContent {
    pub fn new(content: impl Into<String>) -> Self {
        FileContent {
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewContainer {
    pub description: String,
    pub files: BTreeMap<String, FileContent>,
}

/// Partial update of container files: files named in the patch replace their previous content,
/// other files are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilePatch {
    pub files: BTreeMap<String, FileContent>,
}

impl FilePatch {
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), FileContent::new(content));
        self
    }
}

/// Document store client.
///
/// Implementations must surface every failed request as an error: a failure must never look
/// like an empty, successful response.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lists containers owned by the authenticated principal.
    async fn list(&self) -> Result<Vec<Container>, Error>;

    /// Returns `None` if container doesn't exist.
    async fn get(&self, container_id: &str) -> Result<Option<Container>, Error>;

    /// Creates a new container and returns its identifier.
    async fn create(&self, container: NewContainer) -> Result<String, Error>;

    /// Applies a partial files patch to an existing container.
    async fn update(&self, container_id: &str, patch: FilePatch) -> Result<String, Error>;

    async fn fetch_file(&self, file: &FileEntry) -> Result<Bytes, Error>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    async fn list(&self) -> Result<Vec<Container>, Error> {
        (**self).list().await
    }

    async fn get(&self, container_id: &str) -> Result<Option<Container>, Error> {
        (**self).get(container_id).await
    }

    async fn create(&self, container: NewContainer) -> Result<String, Error> {
        (**self).create(container).await
    }

    async fn update(&self, container_id: &str, patch: FilePatch) -> Result<String, Error> {
        (**self).update(container_id, patch).await
    }

    async fn fetch_file(&self, file: &FileEntry) -> Result<Bytes, Error> {
        (**self).fetch_file(file).await
    }
}

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Default)]
struct MemoryContainer {
    description: String,
    files: BTreeMap<String, String>,
}

/// Document store living in process memory. Peers sharing the same instance (ie. behind an
/// `Arc`) can negotiate with each other without any external service.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: RwLock<HashMap<String, MemoryContainer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a container, as if it was deleted by its owner.
    pub async fn remove(&self, container_id: &str) -> bool {
        self.containers.write().await.remove(container_id).is_some()
    }

    /// Content of a single file, if it exists.
    pub async fn file(&self, container_id: &str, filename: &str) -> Option<String> {
        let containers = self.containers.read().await;
        containers.get(container_id)?.files.get(filename).cloned()
    }

    fn summary(id: &str, container: &MemoryContainer) -> Container {
        let files = container
            .files
            .keys()
            .map(|filename| {
                let entry = FileEntry {
                    filename: filename.clone(),
                    raw_url: format!("{MEMORY_SCHEME}{id}/{filename}"),
                };
                (filename.clone(), entry)
            })
            .collect();
        Container {
            id: id.to_owned(),
            description: Some(container.description.clone()),
            files,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list(&self) -> Result<Vec<Container>, Error> {
        let containers = self.containers.read().await;
        Ok(containers
            .iter()
            .map(|(id, c)| Self::summary(id, c))
            .collect())
    }

    async fn get(&self, container_id: &str) -> Result<Option<Container>, Error> {
        let containers = self.containers.read().await;
        Ok(containers
            .get(container_id)
            .map(|c| Self::summary(container_id, c)))
    }

    async fn create(&self, container: NewContainer) -> Result<String, Error> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let files = container
            .files
            .into_iter()
            .map(|(name, file)| (name, file.content))
            .collect();
        let mut containers = self.containers.write().await;
        containers.insert(
            id.clone(),
            MemoryContainer {
                description: container.description,
                files,
            },
        );
        Ok(id)
    }

    async fn update(&self, container_id: &str, patch: FilePatch) -> Result<String, Error> {
        let mut containers = self.containers.write().await;
        match containers.get_mut(container_id) {
            None => Err(Error::StoreStatus {
                status: 404,
                url: format!("{MEMORY_SCHEME}{container_id}"),
            }),
            Some(container) => {
                for (name, file) in patch.files {
                    container.files.insert(name, file.content);
                }
                Ok(container_id.to_owned())
            }
        }
    }

    async fn fetch_file(&self, file: &FileEntry) -> Result<Bytes, Error> {
        let not_found = || Error::StoreStatus {
            status: 404,
            url: file.raw_url.clone(),
        };
        let path = file
            .raw_url
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(not_found)?;
        let (container_id, filename) = path.split_once('/').ok_or_else(not_found)?;
        let content = self
            .file(container_id, filename)
            .await
            .ok_or_else(not_found)?;
        Ok(Bytes::from(content))
    }
}
