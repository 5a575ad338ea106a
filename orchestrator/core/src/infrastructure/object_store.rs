// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Object Store
//!
//! Authoritative in-memory state of the controller, partitioned by lock
//! domain. Each partition is an `Arc` that a commit replaces atomically.
//!
//! A [`Transaction`] is the mutation buffer of one scope. Partitions become
//! visible to it when the scope takes the matching lock; the first write
//! copies the partition (`Arc::make_mut`). Commit renders every written
//! partition into rows, diffs them against the version the transaction
//! started from, hands the difference to the persistence driver and only then
//! installs the new partitions. A discarded or dropped transaction leaves the
//! committed state untouched.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Collaborators:** [`PersistenceDriver`], [`NumberPools`], [`EventBus`]

use crate::domain::connection::{NodeConnection, ResourceConnection, VolumeConnection};
use crate::domain::errors::ApiError;
use crate::domain::events::ObjectEvent;
use crate::domain::external_file::ExternalFile;
use crate::domain::lock_domain::{LockMode, LockObj};
use crate::domain::names::{
    ExternalFileName, NodeName, RemoteName, ResourceGroupName, ResourceName, ScheduleName,
    StorPoolName,
};
use crate::domain::node::Node;
use crate::domain::number_pool::PoolKind;
use crate::domain::props::{keys, Props};
use crate::domain::remote::Remote;
use crate::domain::repository::{
    EntityKind, Persistable, PersistOp, PersistedRow, PersistenceDriver, RepositoryError,
};
use crate::domain::resource::{Resource, Volume};
use crate::domain::resource_definition::{ResourceDefinition, VolumeDefinition};
use crate::domain::resource_group::ResourceGroup;
use crate::domain::schedule::Schedule;
use crate::domain::snapshot::{Snapshot, SnapshotDefinition};
use crate::domain::storage_pool::{StorPool, StorPoolDefinition};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::number_pools::NumberPools;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

// ============================================================================
// Partitions
// ============================================================================

/// `NODES` domain: nodes with their storage pools, and node connections
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTables {
    pub nodes: BTreeMap<NodeName, Node>,
    pub connections: BTreeMap<(NodeName, NodeName), NodeConnection>,
}

/// `CTRL_CONFIG` domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CtrlTables {
    pub props: Props,
}

pub type RscDfnMap = BTreeMap<ResourceName, ResourceDefinition>;
pub type StorPoolDfnMap = BTreeMap<StorPoolName, StorPoolDefinition>;
pub type RemoteMap = BTreeMap<RemoteName, Remote>;
pub type ScheduleMap = BTreeMap<ScheduleName, Schedule>;
pub type ExtFileMap = BTreeMap<ExternalFileName, ExternalFile>;
pub type RscGrpMap = BTreeMap<ResourceGroupName, ResourceGroup>;

const CTRL_PROPS_KEY: &str = "ctrl";

trait Partition {
    fn render(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError>;
}

impl<K, V: Persistable> Partition for BTreeMap<K, V> {
    fn render(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        self.values().try_for_each(|v| v.collect_rows(rows))
    }
}

impl Partition for NodeTables {
    fn render(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        self.nodes.render(rows)?;
        self.connections.render(rows)
    }
}

impl Partition for CtrlTables {
    fn render(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow {
            uuid: Uuid::nil(),
            kind: EntityKind::CtrlProps,
            key: CTRL_PROPS_KEY.to_string(),
            flags: 0,
            props: self.props.to_map(),
            data: serde_json::json!({}),
        });
        Ok(())
    }
}

/// Full committed state; cloning it only clones the partition handles
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub nodes: Arc<NodeTables>,
    pub rsc_dfns: Arc<RscDfnMap>,
    pub stor_pool_dfns: Arc<StorPoolDfnMap>,
    pub remotes: Arc<RemoteMap>,
    pub schedules: Arc<ScheduleMap>,
    pub ext_files: Arc<ExtFileMap>,
    pub rsc_grps: Arc<RscGrpMap>,
    pub ctrl: Arc<CtrlTables>,
}

fn orphan(row: &PersistedRow) -> RepositoryError {
    RepositoryError::Serialization(format!(
        "{} row '{}' references a parent that does not exist",
        row.kind, row.key
    ))
}

impl StoreState {
    fn render(&self, obj: LockObj) -> Result<Vec<PersistedRow>, RepositoryError> {
        let mut rows = Vec::new();
        match obj {
            LockObj::Nodes => self.nodes.render(&mut rows)?,
            LockObj::ResourceDefinitions => self.rsc_dfns.render(&mut rows)?,
            LockObj::StorPoolDefinitions => self.stor_pool_dfns.render(&mut rows)?,
            LockObj::Remotes => self.remotes.render(&mut rows)?,
            LockObj::Schedules => self.schedules.render(&mut rows)?,
            LockObj::ExternalFiles => self.ext_files.render(&mut rows)?,
            LockObj::ResourceGroups => self.rsc_grps.render(&mut rows)?,
            LockObj::CtrlConfig => self.ctrl.render(&mut rows)?,
        }
        Ok(rows)
    }

    /// Points one partition of `self` at the one in `from`
    fn take_partition(&mut self, from: &StoreState, obj: LockObj) {
        match obj {
            LockObj::Nodes => self.nodes = Arc::clone(&from.nodes),
            LockObj::ResourceDefinitions => self.rsc_dfns = Arc::clone(&from.rsc_dfns),
            LockObj::StorPoolDefinitions => self.stor_pool_dfns = Arc::clone(&from.stor_pool_dfns),
            LockObj::Remotes => self.remotes = Arc::clone(&from.remotes),
            LockObj::Schedules => self.schedules = Arc::clone(&from.schedules),
            LockObj::ExternalFiles => self.ext_files = Arc::clone(&from.ext_files),
            LockObj::ResourceGroups => self.rsc_grps = Arc::clone(&from.rsc_grps),
            LockObj::CtrlConfig => self.ctrl = Arc::clone(&from.ctrl),
        }
    }

    /// Rebuilds the state from persisted rows
    pub fn from_rows(mut rows: Vec<PersistedRow>) -> Result<Self, RepositoryError> {
        rows.sort_by_key(|r| r.kind);

        let mut ctrl = CtrlTables::default();
        let mut nodes = NodeTables::default();
        let mut rsc_dfns = RscDfnMap::new();
        let mut stor_pool_dfns = StorPoolDfnMap::new();
        let mut remotes = RemoteMap::new();
        let mut schedules = ScheduleMap::new();
        let mut ext_files = ExtFileMap::new();
        let mut rsc_grps = RscGrpMap::new();

        for row in &rows {
            match row.kind {
                EntityKind::CtrlProps => ctrl.props = row.decode_props()?,
                EntityKind::Node => {
                    let node: Node = row.decode()?;
                    nodes.nodes.insert(node.name.clone(), node);
                }
                EntityKind::StorPool => {
                    let sp: StorPool = row.decode()?;
                    nodes
                        .nodes
                        .get_mut(&sp.node_name)
                        .ok_or_else(|| orphan(row))?
                        .stor_pools
                        .insert(sp.name.clone(), sp);
                }
                EntityKind::NodeConnection => {
                    let conn: NodeConnection = row.decode()?;
                    nodes.connections.insert(conn.pair(), conn);
                }
                EntityKind::StorPoolDefinition => {
                    let dfn: StorPoolDefinition = row.decode()?;
                    stor_pool_dfns.insert(dfn.name.clone(), dfn);
                }
                EntityKind::ResourceGroup => {
                    let grp: ResourceGroup = row.decode()?;
                    rsc_grps.insert(grp.name.clone(), grp);
                }
                EntityKind::ResourceDefinition => {
                    let dfn: ResourceDefinition = row.decode()?;
                    rsc_dfns.insert(dfn.name.clone(), dfn);
                }
                EntityKind::VolumeDefinition => {
                    let vlm_dfn: VolumeDefinition = row.decode()?;
                    rsc_dfns
                        .get_mut(&vlm_dfn.rsc_name)
                        .ok_or_else(|| orphan(row))?
                        .volume_dfns
                        .insert(vlm_dfn.number, vlm_dfn);
                }
                EntityKind::Resource => {
                    let rsc: Resource = row.decode()?;
                    rsc_dfns
                        .get_mut(&rsc.rsc_name)
                        .ok_or_else(|| orphan(row))?
                        .resources
                        .insert(rsc.node_name.clone(), rsc);
                }
                EntityKind::Volume => {
                    let vlm: Volume = row.decode()?;
                    rsc_dfns
                        .get_mut(&vlm.rsc_name)
                        .and_then(|dfn| dfn.resources.get_mut(&vlm.node_name))
                        .ok_or_else(|| orphan(row))?
                        .volumes
                        .insert(vlm.number, vlm);
                }
                EntityKind::ResourceConnection => {
                    let conn: ResourceConnection = row.decode()?;
                    rsc_dfns
                        .get_mut(&conn.rsc_name)
                        .ok_or_else(|| orphan(row))?
                        .connections
                        .insert(conn.pair(), conn);
                }
                EntityKind::VolumeConnection => {
                    let conn: VolumeConnection = row.decode()?;
                    let pair = (conn.node_a.clone(), conn.node_b.clone());
                    rsc_dfns
                        .get_mut(&conn.rsc_name)
                        .and_then(|dfn| dfn.connections.get_mut(&pair))
                        .ok_or_else(|| orphan(row))?
                        .volume_conns
                        .insert(conn.number, conn);
                }
                EntityKind::SnapshotDefinition => {
                    let snap_dfn: SnapshotDefinition = row.decode()?;
                    rsc_dfns
                        .get_mut(&snap_dfn.rsc_name)
                        .ok_or_else(|| orphan(row))?
                        .snapshot_dfns
                        .insert(snap_dfn.name.clone(), snap_dfn);
                }
                EntityKind::Snapshot => {
                    let snap: Snapshot = row.decode()?;
                    rsc_dfns
                        .get_mut(&snap.rsc_name)
                        .and_then(|dfn| dfn.snapshot_dfns.get_mut(&snap.snapshot_name))
                        .ok_or_else(|| orphan(row))?
                        .snapshots
                        .insert(snap.node_name.clone(), snap);
                }
                EntityKind::Remote => {
                    let remote: Remote = row.decode()?;
                    remotes.insert(remote.name.clone(), remote);
                }
                EntityKind::Schedule => {
                    let schedule: Schedule = row.decode()?;
                    schedules.insert(schedule.name.clone(), schedule);
                }
                EntityKind::ExternalFile => {
                    let file: ExternalFile = row.decode()?;
                    ext_files.insert(file.name.clone(), file);
                }
            }
        }

        Ok(Self {
            nodes: Arc::new(nodes),
            rsc_dfns: Arc::new(rsc_dfns),
            stor_pool_dfns: Arc::new(stor_pool_dfns),
            remotes: Arc::new(remotes),
            schedules: Arc::new(schedules),
            ext_files: Arc::new(ext_files),
            rsc_grps: Arc::new(rsc_grps),
            ctrl: Arc::new(ctrl),
        })
    }

    /// Every number the state holds, for re-registration in fresh pools
    fn allocated_numbers(&self) -> Vec<(PoolKind, u32)> {
        let mut numbers = Vec::new();
        for dfn in self.rsc_dfns.values() {
            numbers.push((PoolKind::TcpPort, dfn.tcp_port));
            for vlm_dfn in dfn.volume_dfns.values() {
                numbers.push((PoolKind::MinorNumber, vlm_dfn.minor));
            }
            for snap_dfn in dfn.snapshot_dfns.values().filter(|s| s.is_shipping()) {
                if let Some(port) = snap_dfn
                    .props
                    .get(keys::SHIPPING_PORT)
                    .and_then(|p| p.parse::<u32>().ok())
                {
                    numbers.push((PoolKind::ShippingPort, port));
                }
            }
        }
        numbers
    }
}

/// Computes persistence operations and object events between two renderings
/// of the same partition. Deletes come first (children before parents) so a
/// re-created name never collides with the row it replaces.
fn diff_rows(
    old: Vec<PersistedRow>,
    new: Vec<PersistedRow>,
    deletes: &mut Vec<PersistOp>,
    upserts: &mut Vec<PersistOp>,
    events: &mut Vec<ObjectEvent>,
) {
    let mut previous: HashMap<Uuid, PersistedRow> = old.into_iter().map(|r| (r.uuid, r)).collect();
    for row in new {
        match previous.remove(&row.uuid) {
            Some(prev) if prev == row => {}
            Some(_) => {
                events.push(ObjectEvent::Modified {
                    kind: row.kind,
                    uuid: row.uuid,
                    key: row.key.clone(),
                });
                upserts.push(PersistOp::Upsert(row));
            }
            None => {
                events.push(ObjectEvent::Created {
                    kind: row.kind,
                    uuid: row.uuid,
                    key: row.key.clone(),
                });
                upserts.push(PersistOp::Upsert(row));
            }
        }
    }
    let mut gone: Vec<PersistedRow> = previous.into_values().collect();
    gone.sort_by(|a, b| b.kind.cmp(&a.kind).then_with(|| a.key.cmp(&b.key)));
    for row in gone {
        events.push(ObjectEvent::Deleted {
            kind: row.kind,
            uuid: row.uuid,
            key: row.key,
        });
        deletes.push(PersistOp::Delete {
            uuid: row.uuid,
            kind: row.kind,
        });
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct ObjectStore {
    committed: RwLock<StoreState>,
    driver: Arc<dyn PersistenceDriver>,
    pools: Arc<NumberPools>,
    event_bus: EventBus,
}

impl ObjectStore {
    /// Empty store
    pub fn new(
        driver: Arc<dyn PersistenceDriver>,
        pools: Arc<NumberPools>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            committed: RwLock::new(StoreState::default()),
            driver,
            pools,
            event_bus,
        })
    }

    /// Rebuilds the store from the driver and re-registers every number in use
    pub async fn load(
        driver: Arc<dyn PersistenceDriver>,
        pools: Arc<NumberPools>,
        event_bus: EventBus,
    ) -> Result<Arc<Self>, RepositoryError> {
        let rows = driver.load_all().await?;
        let row_count = rows.len();
        let state = StoreState::from_rows(rows)?;
        for (kind, value) in state.allocated_numbers() {
            if let Err(e) = pools.allocate_specific(kind, value) {
                warn!(pool = %kind, value, "Persisted number could not be re-registered: {}", e);
            }
        }
        debug!(rows = row_count, "Object store loaded");
        Ok(Arc::new(Self {
            committed: RwLock::new(state),
            driver,
            pools,
            event_bus,
        }))
    }

    /// Consistent read-only view of the committed state
    pub fn snapshot(&self) -> StoreState {
        self.committed.read().clone()
    }

    pub fn pools(&self) -> &Arc<NumberPools> {
        &self.pools
    }

    /// Opens a mutation buffer; partitions are attached as locks are taken
    pub fn begin(self: &Arc<Self>, writable: bool) -> Transaction {
        let committed = self.snapshot();
        Transaction {
            store: Arc::clone(self),
            writable,
            held: BTreeMap::new(),
            base: committed.clone(),
            work: committed,
            dirty: BTreeSet::new(),
            allocated: Vec::new(),
            released: Vec::new(),
        }
    }

    fn install(&self, work: &StoreState, objs: &BTreeSet<LockObj>) {
        let mut committed = self.committed.write();
        for obj in objs {
            committed.take_partition(work, *obj);
        }
    }
}

/// Persistence operations of one commit, computed before the driver is called
pub struct PreparedCommit {
    ops: Vec<PersistOp>,
    events: Vec<ObjectEvent>,
    state: StoreState,
    dirty: BTreeSet<LockObj>,
    started: Instant,
}

impl PreparedCommit {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[PersistOp] {
        &self.ops
    }

    /// Hands the operations to the driver; a failure leaves everything unchanged
    pub async fn persist(&self, driver: &dyn PersistenceDriver) -> Result<(), ApiError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        driver.commit(&self.ops).await.map_err(|e| {
            metrics::counter!("stork_scope_commits_total", "result" => "failed").increment(1);
            ApiError::from(e)
        })
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Mutation buffer of one scope
pub struct Transaction {
    store: Arc<ObjectStore>,
    writable: bool,
    held: BTreeMap<LockObj, LockMode>,
    base: StoreState,
    work: StoreState,
    dirty: BTreeSet<LockObj>,
    allocated: Vec<(PoolKind, u32)>,
    released: Vec<(PoolKind, u32)>,
}

macro_rules! partition_accessors {
    ($($get:ident, $get_mut:ident, $field:ident, $ty:ty, $obj:expr;)+) => {
        $(
            pub fn $get(&self) -> Result<&$ty, ApiError> {
                self.check_read($obj)?;
                Ok(self.work.$field.as_ref())
            }

            pub fn $get_mut(&mut self) -> Result<&mut $ty, ApiError> {
                self.check_write($obj)?;
                self.dirty.insert($obj);
                Ok(Arc::make_mut(&mut self.work.$field))
            }
        )+
    };
}

impl Transaction {
    partition_accessors! {
        nodes, nodes_mut, nodes, NodeTables, LockObj::Nodes;
        rsc_dfns, rsc_dfns_mut, rsc_dfns, RscDfnMap, LockObj::ResourceDefinitions;
        stor_pool_dfns, stor_pool_dfns_mut, stor_pool_dfns, StorPoolDfnMap, LockObj::StorPoolDefinitions;
        remotes, remotes_mut, remotes, RemoteMap, LockObj::Remotes;
        schedules, schedules_mut, schedules, ScheduleMap, LockObj::Schedules;
        ext_files, ext_files_mut, ext_files, ExtFileMap, LockObj::ExternalFiles;
        rsc_grps, rsc_grps_mut, rsc_grps, RscGrpMap, LockObj::ResourceGroups;
        ctrl, ctrl_mut, ctrl, CtrlTables, LockObj::CtrlConfig;
    }

    /// Makes a domain visible after its lock was taken
    pub fn attach(&mut self, obj: LockObj, mode: LockMode) {
        let committed = self.store.snapshot();
        self.base.take_partition(&committed, obj);
        self.work.take_partition(&committed, obj);
        self.held.insert(obj, mode);
    }

    /// Hides a domain before its lock is released; unsaved changes to it are dropped
    pub fn detach(&mut self, obj: LockObj) {
        if self.dirty.remove(&obj) {
            warn!(domain = %obj, "Discarding uncommitted changes of released lock domain");
            let base = self.base.clone();
            self.work.take_partition(&base, obj);
        }
        self.held.remove(&obj);
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn held_mode(&self, obj: LockObj) -> Option<LockMode> {
        self.held.get(&obj).copied()
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.allocated.is_empty() || !self.released.is_empty()
    }

    fn check_read(&self, obj: LockObj) -> Result<(), ApiError> {
        if self.held.contains_key(&obj) {
            Ok(())
        } else {
            Err(ApiError::Implementation(format!(
                "{} accessed without holding its lock",
                obj
            )))
        }
    }

    fn check_write(&self, obj: LockObj) -> Result<(), ApiError> {
        if !self.writable {
            return Err(ApiError::Implementation(format!(
                "{} modified in a transactionless scope",
                obj
            )));
        }
        match self.held.get(&obj) {
            Some(LockMode::Write) => Ok(()),
            Some(LockMode::Read) => Err(ApiError::Implementation(format!(
                "{} modified while holding only its read lock",
                obj
            ))),
            None => Err(ApiError::Implementation(format!(
                "{} modified without holding its lock",
                obj
            ))),
        }
    }

    // ========================================================================
    // Number pools
    // ========================================================================

    /// Allocates a number; it returns to the pool if this transaction is discarded
    pub fn allocate(&mut self, kind: PoolKind) -> Result<u32, ApiError> {
        let value = self.store.pools.allocate(kind)?;
        self.allocated.push((kind, value));
        Ok(value)
    }

    pub fn allocate_specific(&mut self, kind: PoolKind, value: u32) -> Result<(), ApiError> {
        self.store.pools.allocate_specific(kind, value)?;
        self.allocated.push((kind, value));
        Ok(())
    }

    /// Returns a number to its pool once this transaction commits
    pub fn release_number(&mut self, kind: PoolKind, value: u32) {
        if let Some(pos) = self.allocated.iter().position(|a| *a == (kind, value)) {
            // allocated and released within the same transaction
            self.allocated.remove(pos);
            if let Err(e) = self.store.pools.deallocate(kind, value) {
                error!(pool = %kind, value, "Failed to release number: {}", e);
            }
            return;
        }
        if !self.released.contains(&(kind, value)) {
            self.released.push((kind, value));
        }
    }

    fn rollback_allocations(&mut self) {
        for (kind, value) in self.allocated.drain(..) {
            if let Err(e) = self.store.pools.deallocate(kind, value) {
                error!(pool = %kind, value, "Failed to roll back number allocation: {}", e);
            }
        }
        self.released.clear();
    }

    // ========================================================================
    // Commit / discard
    // ========================================================================

    /// Renders the written partitions into persistence operations.
    ///
    /// Nothing changes until [`finish_commit`](Self::finish_commit) is called
    /// with the result, after the operations were persisted.
    pub fn prepare_commit(&self) -> Result<PreparedCommit, ApiError> {
        if !self.dirty.is_empty() && !self.writable {
            return Err(ApiError::Implementation(
                "commit of a transactionless scope with pending changes".to_string(),
            ));
        }
        for obj in &self.dirty {
            if self.held.get(obj) != Some(&LockMode::Write) {
                return Err(ApiError::Implementation(format!(
                    "commit of {} without its write lock",
                    obj
                )));
            }
        }

        let mut deletes = Vec::new();
        let mut upserts = Vec::new();
        let mut events = Vec::new();
        for obj in &self.dirty {
            let old = self.base.render(*obj)?;
            let new = self.work.render(*obj)?;
            diff_rows(old, new, &mut deletes, &mut upserts, &mut events);
        }
        deletes.append(&mut upserts);

        Ok(PreparedCommit {
            ops: deletes,
            events,
            state: self.work.clone(),
            dirty: self.dirty.clone(),
            started: Instant::now(),
        })
    }

    pub fn driver(&self) -> Arc<dyn PersistenceDriver> {
        Arc::clone(&self.store.driver)
    }

    /// Installs a prepared commit whose operations were persisted
    pub fn finish_commit(&mut self, prepared: PreparedCommit) {
        self.store.install(&prepared.state, &prepared.dirty);
        for obj in &prepared.dirty {
            self.base.take_partition(&prepared.state, *obj);
            self.dirty.remove(obj);
        }

        self.allocated.clear();
        for (kind, value) in self.released.drain(..) {
            if let Err(e) = self.store.pools.deallocate(kind, value) {
                error!(pool = %kind, value, "Failed to release number after commit: {}", e);
            }
        }

        metrics::counter!("stork_scope_commits_total", "result" => "ok").increment(1);
        debug!(
            ops = prepared.ops.len(),
            elapsed_ms = prepared.started.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        for event in prepared.events {
            self.store.event_bus.publish_object_event(event);
        }
    }

    /// Persists and installs every written partition
    pub async fn commit(&mut self) -> Result<(), ApiError> {
        let prepared = self.prepare_commit()?;
        prepared.persist(self.driver().as_ref()).await?;
        self.finish_commit(prepared);
        Ok(())
    }

    /// Drops every uncommitted change and returns pending allocations
    pub fn discard(&mut self) {
        let base = self.base.clone();
        for obj in std::mem::take(&mut self.dirty) {
            self.work.take_partition(&base, obj);
        }
        self.rollback_allocations();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.dirty.is_empty() {
            debug!(domains = self.dirty.len(), "Dropping transaction with uncommitted changes");
        }
        self.rollback_allocations();
    }
}
