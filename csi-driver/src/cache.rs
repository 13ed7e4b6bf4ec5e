//! In-process caches for backend lookups.
//!
//! Both caches follow the same locking discipline: the lock guards only the
//! in-memory structure, never a gateway call. Concurrent misses may each
//! fetch; the last write wins, which is safe because backend values for a
//! given key are stable.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::RwLock;
use tonic::Status;

use sio_client::Volume;

/// Memoizes name/GUID to backend-id lookups.
///
/// Keys are case-normalized before lookup and storage. Entries are
/// populate-once for the process lifetime; there is no invalidation, so a
/// backend that reassigns an id for the same key (e.g. a host re-registering
/// with a new id) requires a plugin restart.
#[derive(Default)]
pub struct IdCache {
    map: RwLock<HashMap<String, String>>,
}

impl IdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `key`, calling `fetch` on a miss and memoizing its answer.
    ///
    /// `fetch` runs with no lock held; a second in-flight fetch for the same
    /// key overwrites with an equal value.
    pub async fn resolve<F, Fut, E>(&self, key: &str, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let normalized = key.to_ascii_uppercase();

        if let Some(id) = self.map.read().await.get(&normalized) {
            return Ok(id.clone());
        }

        let id = fetch().await?;
        self.map.write().await.insert(normalized, id.clone());
        Ok(id)
    }
}

/// Snapshot cache over the backend's full volume listing, used to serve
/// paginated ListVolumes without re-querying the backend on every page.
///
/// A snapshot is either empty (meaning "re-fetch from the backend") or a
/// complete listing taken at one point in time; it is never partially
/// updated. The lifecycle controller clears it after every create or delete.
#[derive(Default)]
pub struct VolumeDirectory {
    snapshot: RwLock<Vec<Volume>>,
}

impl VolumeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve one page of the listing.
    ///
    /// A fresh listing is fetched when the token is zero or no snapshot
    /// exists. A listing that fits within one page (`max_entries` of zero,
    /// or at least the total count) is returned directly without caching;
    /// otherwise the snapshot is replaced and later pages come from memory.
    pub async fn page<F, Fut>(
        &self,
        start: u32,
        max_entries: u32,
        fetch_all: F,
    ) -> Result<(Vec<Volume>, Option<u32>), Status>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Volume>, Status>>,
    {
        let cached_len = self.snapshot.read().await.len();

        if start == 0 || cached_len == 0 {
            let vols = fetch_all().await?;
            if max_entries > 0 && (max_entries as usize) < vols.len() {
                *self.snapshot.write().await = vols.clone();
            }
            slice_page(&vols, start, max_entries)
        } else {
            let snap = self.snapshot.read().await;
            slice_page(&snap, start, max_entries)
        }
    }

    /// Drop the snapshot so the next listing re-fetches from the backend.
    pub async fn clear(&self) {
        self.snapshot.write().await.clear();
    }
}

fn slice_page(
    vols: &[Volume],
    start: u32,
    max_entries: u32,
) -> Result<(Vec<Volume>, Option<u32>), Status> {
    let total = vols.len() as u32;
    if start > total {
        return Err(Status::aborted(format!(
            "startingToken={} > len(vols)={}",
            start, total
        )));
    }

    let rem = total - start;
    let count = if max_entries == 0 || max_entries > rem {
        rem
    } else {
        max_entries
    };

    let page = vols[start as usize..(start + count) as usize].to_vec();
    let next = (start + count < total).then_some(start + count);
    Ok((page, next))
}
