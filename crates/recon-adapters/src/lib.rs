//! Record source adapter: turns a store's cursor pagination into one lazy,
//! restartable sequence of records, plus fixture snapshots for offline runs.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use recon_core::Record;
use recon_storage::{MemoryStore, RecordStore, StoreError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {store_id} unavailable while reading page {page}: {source}")]
    Unavailable {
        store_id: String,
        page: usize,
        #[source]
        source: StoreError,
    },
    #[error("source {store_id} handed back cursor `{cursor}` twice in one scan")]
    CursorCycle { store_id: String, cursor: String },
}

/// Full-scan view over a [`RecordStore`].
#[derive(Clone)]
pub struct RecordSource {
    store: Arc<dyn RecordStore>,
}

struct ScanState {
    store: Arc<dyn RecordStore>,
    cursor: Option<String>,
    finished: bool,
    pages_read: usize,
    buffered: VecDeque<Record>,
    seen_cursors: HashSet<String>,
    seen_ids: HashSet<String>,
}

impl RecordSource {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store_id(&self) -> &str {
        self.store.store_id()
    }

    /// Streams every live record once. Pages are requested only as the
    /// consumer pulls; each call starts a fresh scan from the first page.
    ///
    /// A record id already emitted in this scan is dropped. The first store
    /// error ends the stream with [`SourceError::Unavailable`].
    pub fn fetch_all(&self) -> BoxStream<'static, Result<Record, SourceError>> {
        let state = ScanState {
            store: Arc::clone(&self.store),
            cursor: None,
            finished: false,
            pages_read: 0,
            buffered: VecDeque::new(),
            seen_cursors: HashSet::new(),
            seen_ids: HashSet::new(),
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(record) = state.buffered.pop_front() {
                    if !state.seen_ids.insert(record.record_id.clone()) {
                        warn!(
                            store = state.store.store_id(),
                            record_id = %record.record_id,
                            "store listed record twice; keeping first occurrence"
                        );
                        continue;
                    }
                    return Ok(Some((record, state)));
                }

                if state.finished {
                    return Ok(None);
                }

                let page = match state.store.query(state.cursor.as_deref()).await {
                    Ok(page) => page,
                    Err(source) => {
                        return Err(SourceError::Unavailable {
                            store_id: state.store.store_id().to_string(),
                            page: state.pages_read,
                            source,
                        })
                    }
                };
                state.pages_read += 1;
                debug!(
                    store = state.store.store_id(),
                    page = state.pages_read,
                    items = page.items.len(),
                    "fetched page"
                );
                state.buffered.extend(page.items);

                match page.next_cursor {
                    Some(next) => {
                        if !state.seen_cursors.insert(next.clone()) {
                            return Err(SourceError::CursorCycle {
                                store_id: state.store.store_id().to_string(),
                                cursor: next,
                            });
                        }
                        state.cursor = Some(next);
                    }
                    None => state.finished = true,
                }
            }
        })
        .boxed()
    }

    /// Collects a complete scan; any source error discards what was read.
    pub async fn snapshot(&self) -> Result<Vec<Record>, SourceError> {
        self.fetch_all().try_collect().await
    }
}

/// Captured store contents used for offline rehearsal runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    pub store_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<Record>,
}

pub fn load_fixture_snapshot(path: impl AsRef<Path>) -> Result<FixtureSnapshot> {
    read_json_file(path)
}

/// Loads a fixture file into a fresh [`MemoryStore`]. Archives against it only
/// touch the in-process copy.
pub fn fixture_store(path: impl AsRef<Path>, page_size: usize) -> Result<MemoryStore> {
    let path = path.as_ref();
    let snapshot = load_fixture_snapshot(path)?;
    let store_id = format!("fixture:{}", snapshot.store_id);
    Ok(MemoryStore::new(store_id, snapshot.records).with_page_size(page_size))
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
