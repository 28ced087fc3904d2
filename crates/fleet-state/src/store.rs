//! StateStore — redb-backed persistence for the fleet hub.
//!
//! Provides typed operations over placements, policy snapshots, member
//! clusters, bindings and update runs. All values are JSON-serialized into
//! redb's `&[u8]` value columns.
//!
//! Writes are optimistic: every object carries a `resource_version`, and an
//! update whose version does not match the stored one fails with
//! [`StateError::Conflict`]. Every committed write is announced on a
//! broadcast channel so controllers can turn changes into work-queue keys.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::update_run::UpdateRun;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── Change events ─────────────────────────────────────────────────

/// Kind of object a [`StoreEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Placement,
    PolicySnapshot,
    MemberCluster,
    Binding,
    UpdateRun,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Placement => "placement",
            Self::PolicySnapshot => "policy snapshot",
            Self::MemberCluster => "member cluster",
            Self::Binding => "binding",
            Self::UpdateRun => "update run",
        })
    }
}

/// A committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ObjectKind,
    pub key: ObjectKey,
    /// Placement the object belongs to (itself, for placements).
    pub placement: Option<ObjectKey>,
    pub deleted: bool,
}

// ── Stored objects ────────────────────────────────────────────────

/// Glue between a domain type and its redb table.
trait StoredObject: Serialize + DeserializeOwned + Clone {
    const TABLE: JsonTable;
    const KIND: ObjectKind;

    fn table_key(&self) -> String;
    fn object_key(&self) -> ObjectKey;
    fn resource_version(&self) -> u64;
    fn set_resource_version(&mut self, version: u64);

    fn placement_key(&self) -> Option<ObjectKey> {
        None
    }

    /// Deletion was requested and nothing holds the object anymore.
    fn is_finalized(&self) -> bool {
        false
    }
}

impl StoredObject for Placement {
    const TABLE: JsonTable = PLACEMENTS;
    const KIND: ObjectKind = ObjectKind::Placement;

    fn table_key(&self) -> String {
        self.key().table_key()
    }
    fn object_key(&self) -> ObjectKey {
        self.key()
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
    fn placement_key(&self) -> Option<ObjectKey> {
        Some(self.key())
    }
    fn is_finalized(&self) -> bool {
        self.is_deleting() && self.finalizers.is_empty()
    }
}

impl StoredObject for PolicySnapshot {
    const TABLE: JsonTable = POLICY_SNAPSHOTS;
    const KIND: ObjectKind = ObjectKind::PolicySnapshot;

    fn table_key(&self) -> String {
        self.key().table_key()
    }
    fn object_key(&self) -> ObjectKey {
        self.key()
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
    fn placement_key(&self) -> Option<ObjectKey> {
        Some(ObjectKey {
            namespace: self.namespace.clone(),
            name: self.placement_name.clone(),
        })
    }
}

impl StoredObject for MemberCluster {
    const TABLE: JsonTable = MEMBER_CLUSTERS;
    const KIND: ObjectKind = ObjectKind::MemberCluster;

    fn table_key(&self) -> String {
        self.name.clone()
    }
    fn object_key(&self) -> ObjectKey {
        ObjectKey::cluster_scoped(&self.name)
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
}

impl StoredObject for Binding {
    const TABLE: JsonTable = BINDINGS;
    const KIND: ObjectKind = ObjectKind::Binding;

    fn table_key(&self) -> String {
        Binding::table_key(self)
    }
    fn object_key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
    fn placement_key(&self) -> Option<ObjectKey> {
        Some(ObjectKey {
            namespace: self.namespace.clone(),
            name: self.placement_name.clone(),
        })
    }
}

impl StoredObject for UpdateRun {
    const TABLE: JsonTable = UPDATE_RUNS;
    const KIND: ObjectKind = ObjectKind::UpdateRun;

    fn table_key(&self) -> String {
        self.key().table_key()
    }
    fn object_key(&self) -> ObjectKey {
        self.key()
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
    fn placement_key(&self) -> Option<ObjectKey> {
        Some(ObjectKey {
            namespace: self.namespace.clone(),
            name: self.spec.placement_name.clone(),
        })
    }
}

// ── Store ─────────────────────────────────────────────────────────

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [PLACEMENTS, POLICY_SNAPSHOTS, MEMBER_CLUSTERS, BINDINGS, UPDATE_RUNS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to committed changes. Lagging receivers lose old events and
    /// should fall back to a full resync.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify<T: StoredObject>(&self, obj: &T, deleted: bool) {
        // No receivers is fine.
        let _ = self.events.send(StoreEvent {
            kind: T::KIND,
            key: obj.object_key(),
            placement: obj.placement_key(),
            deleted,
        });
    }

    // ── Generic operations ─────────────────────────────────────────

    fn get_object<T: StoredObject>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    fn list_objects<T: StoredObject>(&self, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let obj: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(obj);
            }
        }
        Ok(results)
    }

    fn create_object<T: StoredObject>(&self, obj: &T) -> StateResult<T> {
        let key = obj.table_key();
        let mut created = obj.clone();
        created.set_resource_version(1);
        let value = serde_json::to_vec(&created).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("{} {key}", T::KIND)));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, "object created");
        self.notify(&created, false);
        Ok(created)
    }

    /// Compare-and-swap on `resource_version`. Finalized objects are removed
    /// instead of written.
    fn update_object<T: StoredObject>(&self, obj: &T) -> StateResult<T> {
        let key = obj.table_key();
        let mut updated = obj.clone();
        let removed = updated.is_finalized();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let current: T = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("{} {key}", T::KIND))),
            };
            if current.resource_version() != obj.resource_version() {
                return Err(StateError::Conflict {
                    key,
                    expected: obj.resource_version(),
                    actual: current.resource_version(),
                });
            }
            updated.set_resource_version(current.resource_version() + 1);
            if removed {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            } else {
                let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, version = updated.resource_version(), removed, "object updated");
        self.notify(&updated, removed);
        Ok(updated)
    }

    /// Remove an object if its version still matches. Returns false when it
    /// was already gone.
    fn delete_object<T: StoredObject>(&self, obj: &T) -> StateResult<bool> {
        let key = obj.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let current: T = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Ok(false),
            };
            if current.resource_version() != obj.resource_version() {
                return Err(StateError::Conflict {
                    key,
                    expected: obj.resource_version(),
                    actual: current.resource_version(),
                });
            }
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, "object deleted");
        self.notify(obj, true);
        Ok(true)
    }

    // ── Placements ─────────────────────────────────────────────────

    pub fn create_placement(&self, placement: &Placement) -> StateResult<Placement> {
        self.create_object(placement)
    }

    pub fn get_placement(&self, key: &ObjectKey) -> StateResult<Option<Placement>> {
        self.get_object(&key.table_key())
    }

    pub fn list_placements(&self) -> StateResult<Vec<Placement>> {
        self.list_objects("")
    }

    /// Versioned write. A deleting placement whose last finalizer was just
    /// removed is dropped from the store.
    pub fn update_placement(&self, placement: &Placement) -> StateResult<Placement> {
        self.update_object(placement)
    }

    /// Mark a placement for deletion. Placements without finalizers go away
    /// immediately; the others keep a deletion timestamp until their holders
    /// release them. Returns false if the placement does not exist.
    pub fn request_placement_deletion(&self, key: &ObjectKey, now: u64) -> StateResult<bool> {
        let Some(mut placement) = self.get_placement(key)? else {
            return Ok(false);
        };
        if placement.finalizers.is_empty() {
            return self.delete_object(&placement);
        }
        if placement.deletion_timestamp.is_none() {
            placement.deletion_timestamp = Some(now);
            self.update_object(&placement)?;
        }
        Ok(true)
    }

    // ── Policy snapshots ───────────────────────────────────────────

    pub fn create_policy_snapshot(&self, snapshot: &PolicySnapshot) -> StateResult<PolicySnapshot> {
        self.create_object(snapshot)
    }

    pub fn get_policy_snapshot(&self, key: &ObjectKey) -> StateResult<Option<PolicySnapshot>> {
        self.get_object(&key.table_key())
    }

    /// All snapshots of one placement, ordered by index.
    pub fn list_policy_snapshots(
        &self,
        placement: &ObjectKey,
    ) -> StateResult<Vec<PolicySnapshot>> {
        let prefix = format!("{}/", placement.namespace.as_deref().unwrap_or(""));
        let mut snapshots: Vec<PolicySnapshot> = self
            .list_objects::<PolicySnapshot>(&prefix)?
            .into_iter()
            .filter(|s| s.placement_name == placement.name && s.namespace == placement.namespace)
            .collect();
        snapshots.sort_by_key(|s| s.index);
        Ok(snapshots)
    }

    /// The snapshot with the highest index, if any.
    pub fn latest_policy_snapshot(
        &self,
        placement: &ObjectKey,
    ) -> StateResult<Option<PolicySnapshot>> {
        Ok(self.list_policy_snapshots(placement)?.pop())
    }

    /// Versioned status write.
    pub fn update_policy_snapshot(&self, snapshot: &PolicySnapshot) -> StateResult<PolicySnapshot> {
        self.update_object(snapshot)
    }

    // ── Member clusters ────────────────────────────────────────────

    /// Insert or replace a member cluster regardless of its stored version.
    /// The inventory is owned by the membership agents, not by controllers.
    pub fn put_member_cluster(&self, cluster: &MemberCluster) -> StateResult<MemberCluster> {
        match self.get_object::<MemberCluster>(&cluster.name)? {
            Some(existing) => {
                let mut next = cluster.clone();
                next.resource_version = existing.resource_version;
                self.update_object(&next)
            }
            None => self.create_object(cluster),
        }
    }

    pub fn get_member_cluster(&self, name: &str) -> StateResult<Option<MemberCluster>> {
        self.get_object(name)
    }

    pub fn list_member_clusters(&self) -> StateResult<Vec<MemberCluster>> {
        self.list_objects("")
    }

    pub fn delete_member_cluster(&self, name: &str) -> StateResult<bool> {
        match self.get_member_cluster(name)? {
            Some(cluster) => self.delete_object(&cluster),
            None => Ok(false),
        }
    }

    // ── Bindings ───────────────────────────────────────────────────

    pub fn create_binding(&self, binding: &Binding) -> StateResult<Binding> {
        self.create_object(binding)
    }

    pub fn get_binding(
        &self,
        namespace: Option<&str>,
        placement_name: &str,
        cluster_name: &str,
    ) -> StateResult<Option<Binding>> {
        self.get_object(&binding_table_key(namespace, placement_name, cluster_name))
    }

    /// All bindings of one placement, ordered by target cluster.
    pub fn list_bindings_for_placement(&self, placement: &ObjectKey) -> StateResult<Vec<Binding>> {
        let prefix = format!(
            "{}/{}:",
            placement.namespace.as_deref().unwrap_or(""),
            placement.name
        );
        self.list_objects(&prefix)
    }

    pub fn list_bindings(&self) -> StateResult<Vec<Binding>> {
        self.list_objects("")
    }

    pub fn update_binding(&self, binding: &Binding) -> StateResult<Binding> {
        self.update_object(binding)
    }

    pub fn delete_binding(&self, binding: &Binding) -> StateResult<bool> {
        self.delete_object(binding)
    }

    // ── Update runs ────────────────────────────────────────────────

    pub fn create_update_run(&self, run: &UpdateRun) -> StateResult<UpdateRun> {
        self.create_object(run)
    }

    pub fn get_update_run(&self, key: &ObjectKey) -> StateResult<Option<UpdateRun>> {
        self.get_object(&key.table_key())
    }

    pub fn list_update_runs(&self) -> StateResult<Vec<UpdateRun>> {
        self.list_objects("")
    }

    pub fn update_update_run(&self, run: &UpdateRun) -> StateResult<UpdateRun> {
        self.update_object(run)
    }

    /// Stamp a deletion timestamp so the rollout controller can release the
    /// run's metrics before it calls [`StateStore::delete_update_run`].
    pub fn request_update_run_deletion(&self, key: &ObjectKey, now: u64) -> StateResult<bool> {
        let Some(mut run) = self.get_update_run(key)? else {
            return Ok(false);
        };
        if run.deletion_timestamp.is_none() {
            run.deletion_timestamp = Some(now);
            self.update_object(&run)?;
        }
        Ok(true)
    }

    pub fn delete_update_run(&self, run: &UpdateRun) -> StateResult<bool> {
        self.delete_object(run)
    }
}
