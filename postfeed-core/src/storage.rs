use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::PageCache;
use crate::error::FeedError;
use crate::post::{CachePage, PostSummary};
use crate::stream::{boxed, BatchStream};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct IndexData {
    ids: BTreeSet<i64>,
}

/// [`PageCache`] persisted as one JSON file per page under a directory per
/// scope:
///
/// ```text
/// <root>/<scope>/page-1.json
/// <root>/<scope>/page-2.json
/// <root>/<scope>/index.json
/// ```
///
/// Writes go through a `.json.tmp` sibling and a rename. On a corrupted file
/// the tmp sibling is tried before the entry is treated as absent.
#[derive(Debug, Clone)]
pub struct JsonPageCache {
    root: PathBuf,
    // scope -> write lock; serializes page writes and index read-modify-write
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl JsonPageCache {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, FeedError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.root.join(scope_dir_name(scope))
    }

    fn page_path(&self, scope: &str, page: u32) -> PathBuf {
        self.scope_dir(scope).join(format!("page-{page}.json"))
    }

    fn index_path(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(INDEX_FILE)
    }

    fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(scope.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cached_page_numbers(&self, scope: &str) -> Result<Vec<u32>, FeedError> {
        let dir = self.scope_dir(scope);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(page) = entry.file_name().to_str().and_then(parse_page_file_name) {
                pages.push(page);
            }
        }
        pages.sort_unstable();
        Ok(pages)
    }

    async fn read_index(&self, scope: &str) -> Result<IndexData, FeedError> {
        Ok(read_json_with_tmp_fallback(&self.index_path(scope))
            .await?
            .unwrap_or_default())
    }
}

/// Maps a scope key to a directory name that is safe on every platform.
fn scope_dir_name(scope: &str) -> String {
    let name: String = scope
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_owned()
    } else {
        name
    }
}

fn parse_page_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("page-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

// Missing file -> None. Unparsable file -> tmp sibling, then None.
async fn read_json_with_tmp_fallback<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, FeedError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to parse cache file, trying tmp fallback");
            let tmp = path.with_extension("json.tmp");
            match tokio::fs::read(&tmp).await {
                Ok(tmp_bytes) => Ok(serde_json::from_slice::<T>(&tmp_bytes).ok()),
                Err(_) => Ok(None),
            }
        }
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FeedError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl PageCache for JsonPageCache {
    async fn get_page(&self, scope: &str, page: u32) -> Result<Option<CachePage>, FeedError> {
        read_json_with_tmp_fallback(&self.page_path(scope, page)).await
    }

    async fn upsert_page(&self, scope: &str, page: CachePage) -> Result<(), FeedError> {
        let lock = self.scope_lock(scope);
        let _guard = lock.lock().await;
        write_json_atomic(&self.page_path(scope, page.page), &page).await
    }

    fn read_all_pages<'a>(&'a self, scope: &'a str) -> BatchStream<'a> {
        boxed(try_stream! {
            let pages = self.cached_page_numbers(scope).await?;
            debug!(scope = %scope, pages = pages.len(), "replaying cached pages from disk");
            for number in pages {
                let page: Option<CachePage> =
                    read_json_with_tmp_fallback(&self.page_path(scope, number)).await?;
                if let Some(page) = page {
                    yield page.items;
                }
            }
        })
    }

    async fn all_known_ids(&self, scope: &str) -> Result<HashSet<i64>, FeedError> {
        Ok(self.read_index(scope).await?.ids.into_iter().collect())
    }

    async fn upsert_index(&self, scope: &str, items: &[PostSummary]) -> Result<(), FeedError> {
        let lock = self.scope_lock(scope);
        let _guard = lock.lock().await;
        let mut index = self.read_index(scope).await?;
        let before = index.ids.len();
        index.ids.extend(items.iter().map(|p| p.id));
        if index.ids.len() == before {
            debug!(scope = %scope, "id index unchanged");
            return Ok(());
        }
        write_json_atomic(&self.index_path(scope), &index).await
    }

    async fn remove_from_index(&self, scope: &str, ids: &[i64]) -> Result<(), FeedError> {
        let lock = self.scope_lock(scope);
        let _guard = lock.lock().await;
        let mut index = self.read_index(scope).await?;
        let before = index.ids.len();
        for id in ids {
            index.ids.remove(id);
        }
        if index.ids.len() == before {
            return Ok(());
        }
        write_json_atomic(&self.index_path(scope), &index).await
    }

    async fn prune_pages_after(&self, scope: &str, last_page: u32) -> Result<(), FeedError> {
        let lock = self.scope_lock(scope);
        let _guard = lock.lock().await;
        for page in self.cached_page_numbers(scope).await? {
            if page <= last_page {
                continue;
            }
            let path = self.page_path(scope, page);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(scope = %scope, page, "pruned cached page"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
