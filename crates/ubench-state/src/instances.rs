//! InstanceStore: every tracked instance as one ordered snapshot.
//!
//! The snapshot is a JSON array stored under a single key. Each mutation
//! reads it, changes it in memory and writes the complete array back within
//! the same redb write transaction, so the file always holds a whole,
//! consistent list.

use std::path::Path;

use redb::ReadableTable;
use tracing::{debug, error};

use crate::db::{map_err, Db};
use crate::error::{StateError, StateResult};
use crate::tables::{INSTANCES, SNAPSHOT_KEY};
use crate::types::{Instance, InstanceKind};

/// Durable table of instances shared across ubench invocations.
#[derive(Clone)]
pub struct InstanceStore {
    db: Db,
}

impl InstanceStore {
    /// Use the store at `path`, creating its directory if needed.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Db::file(path)?;
        debug!(?path, "instance store opened");
        Ok(Self { db })
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Ok(Self { db: Db::memory()? })
    }

    /// Every instance in creation order.
    ///
    /// A missing store is empty. An unreadable snapshot is logged and
    /// treated as empty; the next write replaces it.
    pub fn list(&self) -> StateResult<Vec<Instance>> {
        let raw = self.db.get(INSTANCES, SNAPSHOT_KEY)?;
        Ok(decode_snapshot(raw.as_deref()))
    }

    pub fn list_kind(&self, kind: InstanceKind) -> StateResult<Vec<Instance>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.kind == kind)
            .collect())
    }

    pub fn get(&self, id: &str) -> StateResult<Option<Instance>> {
        Ok(self.list()?.into_iter().find(|i| i.id == id))
    }

    /// Insert an instance, replacing any record with the same id in place.
    pub fn put(&self, instance: &Instance) -> StateResult<()> {
        let id = instance.id.clone();
        self.mutate(|instances| {
            match instances.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => instances.push(instance.clone()),
            }
        })?;
        debug!(instance_id = %id, status = %instance.status, "instance stored");
        Ok(())
    }

    /// Read-modify-write one instance inside a single transaction.
    ///
    /// Returns the record as stored after `f` ran, or `None` if no instance
    /// has that id.
    pub fn update<F>(&self, id: &str, f: F) -> StateResult<Option<Instance>>
    where
        F: FnOnce(&mut Instance),
    {
        self.mutate(|instances| {
            let instance = instances.iter_mut().find(|i| i.id == id)?;
            f(instance);
            Some(instance.clone())
        })
    }

    /// Remove one instance. Returns true if it existed.
    pub fn remove(&self, id: &str) -> StateResult<bool> {
        let removed = self.mutate(|instances| {
            let before = instances.len();
            instances.retain(|i| i.id != id);
            before != instances.len()
        })?;
        debug!(instance_id = %id, removed, "instance removed");
        Ok(removed)
    }

    /// Remove every instance matching `pred`. Returns the removed records.
    pub fn remove_where<P>(&self, pred: P) -> StateResult<Vec<Instance>>
    where
        P: Fn(&Instance) -> bool,
    {
        self.mutate(|instances| {
            let (removed, kept): (Vec<Instance>, Vec<Instance>) =
                instances.drain(..).partition(|i| pred(i));
            *instances = kept;
            removed
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Instance>) -> T) -> StateResult<T> {
        self.db.write(|txn| {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instances = {
                let current = table.get(SNAPSHOT_KEY).map_err(map_err!(Read))?;
                decode_snapshot(current.as_ref().map(|guard| guard.value()))
            };
            let out = f(&mut instances);
            let value = serde_json::to_vec(&instances).map_err(map_err!(Serialize))?;
            table
                .insert(SNAPSHOT_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(out)
        })
    }
}

fn decode_snapshot(raw: Option<&[u8]>) -> Vec<Instance> {
    let Some(bytes) = raw else {
        return Vec::new();
    };
    match serde_json::from_slice(bytes) {
        Ok(instances) => instances,
        Err(e) => {
            error!(error = %e, "instance snapshot is corrupt, treating it as empty");
            Vec::new()
        }
    }
}

impl std::fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStore").finish_non_exhaustive()
    }
}
