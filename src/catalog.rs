// bookpay/src/catalog.rs
// Read-only view of the resource catalog: which resources exist and where
// their files live.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::orders::ResourceRef;

pub const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceRef,
    pub title: String,
    pub file: PathBuf,
}

#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn find(&self, resource_ref: ResourceRef) -> Option<Resource>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("resource {id} file {file:?} escapes the resources directory")]
    UnsafePath { id: ResourceRef, file: String },
}

#[derive(Deserialize)]
struct CatalogEntry {
    id: ResourceRef,
    title: String,
    file: String,
}

/// Catalog loaded once from `<dir>/catalog.json`. Entry files are relative to
/// `dir` and may not climb out of it.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    resources: HashMap<ResourceRef, Resource>,
}

impl FileCatalog {
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let path = dir.join(CATALOG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_json(dir, &raw)
    }

    pub fn from_json(dir: &Path, raw: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(raw)?;
        let mut resources = HashMap::with_capacity(entries.len());

        for entry in entries {
            let relative = Path::new(&entry.file);
            let safe = relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !safe {
                return Err(CatalogError::UnsafePath {
                    id: entry.id,
                    file: entry.file,
                });
            }
            resources.insert(
                entry.id,
                Resource {
                    id: entry.id,
                    title: entry.title,
                    file: dir.join(relative),
                },
            );
        }

        Ok(Self { resources })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }
}

#[async_trait]
impl ResourceCatalog for FileCatalog {
    async fn find(&self, resource_ref: ResourceRef) -> Option<Resource> {
        self.resources.get(&resource_ref).cloned()
    }
}
