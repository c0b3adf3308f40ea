//! DiscoveryRegistry: logical service name → last known placement.
//!
//! Lets a monitor or client started later, in another process, find a
//! server by the `service_name` it was deployed under. Registration is an
//! upsert: the newest entry for a name replaces the previous one entirely.

use std::path::Path;

use redb::ReadableTableMetadata;
use tracing::{debug, error, info};

use crate::db::{map_err, Db};
use crate::error::{StateError, StateResult};
use crate::tables::DISCOVERY;
use crate::types::{epoch_secs, DiscoveryEntry};

/// File-backed discovery registry.
#[derive(Clone)]
pub struct DiscoveryRegistry {
    db: Db,
}

impl DiscoveryRegistry {
    /// Use the registry at `path`, creating its directory if needed.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Db::file(path)?;
        debug!(?path, "discovery registry opened");
        Ok(Self { db })
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Ok(Self { db: Db::memory()? })
    }

    /// Publish `name` at `host`. Replaces any previous entry for `name`.
    pub fn register(
        &self,
        name: &str,
        host: &str,
        ports: &[u16],
        handle: &str,
    ) -> StateResult<DiscoveryEntry> {
        let entry = DiscoveryEntry {
            service_name: name.to_string(),
            host: host.to_string(),
            ports: ports.to_vec(),
            handle: handle.to_string(),
            updated_at: epoch_secs(),
        };
        let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        self.db.write(|txn| {
            let mut table = txn.open_table(DISCOVERY).map_err(map_err!(Table))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        info!(service = %name, %host, ?ports, %handle, "service registered");
        Ok(entry)
    }

    /// Last known placement of `name`.
    pub fn lookup(&self, name: &str) -> StateResult<Option<DiscoveryEntry>> {
        let raw = self.db.get(DISCOVERY, name)?;
        Ok(raw.and_then(|bytes| decode_entry(name, &bytes)))
    }

    /// Every entry ordered by service name.
    pub fn list(&self) -> StateResult<Vec<DiscoveryEntry>> {
        Ok(self
            .db
            .scan(DISCOVERY)?
            .into_iter()
            .filter_map(|(name, bytes)| decode_entry(&name, &bytes))
            .collect())
    }

    /// Forget one service. Returns true if it was registered.
    pub fn remove(&self, name: &str) -> StateResult<bool> {
        let existed = self.db.write(|txn| {
            let mut table = txn.open_table(DISCOVERY).map_err(map_err!(Table))?;
            let existed = table.remove(name).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })?;
        debug!(service = %name, existed, "discovery entry removed");
        Ok(existed)
    }

    /// Forget every service. Returns how many entries were dropped.
    pub fn clear(&self) -> StateResult<usize> {
        let count = self.db.write(|txn| {
            let mut table = txn.open_table(DISCOVERY).map_err(map_err!(Table))?;
            let count = table.len().map_err(map_err!(Read))? as usize;
            table.retain(|_, _| false).map_err(map_err!(Write))?;
            Ok(count)
        })?;
        info!(count, "discovery registry cleared");
        Ok(count)
    }
}

fn decode_entry(name: &str, bytes: &[u8]) -> Option<DiscoveryEntry> {
    match serde_json::from_slice(bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
            error!(service = %name, error = %e, "discovery entry is corrupt, ignoring it");
            None
        }
    }
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryRegistry").finish_non_exhaustive()
    }
}
