// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource
//!
//! A resource is the deployment of a resource definition on one node; its
//! volumes are the per-node instances of the volume definitions.
//!
//! Disk toggling is a multi-step transition driven by flags:
//!
//! ```text
//! DISKLESS -> DISK_ADD_REQUESTED -> DISK_ADDING -> (diskful)
//! (diskful) -> DISK_REMOVE_REQUESTED -> DISK_REMOVING -> DISKLESS
//! ```
//!
//! Deactivation and reactivation take one propagation each:
//!
//! ```text
//! (active) -> INACTIVE | INACTIVATING -> INACTIVE
//! INACTIVE -> REACTIVATE -> (active)
//! ```

use crate::domain::flags::{lifecycle_flags, StateFlags};
use crate::domain::names::{NodeName, ResourceName, StorPoolName, VolumeNumber};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

lifecycle_flags! {
    pub enum ResourceFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        Diskless(1) "DISKLESS" requires [] forbids [] sticky false,
        DiskAddRequested(2) "DISK_ADD_REQUESTED" requires [Diskless]
            forbids [Delete, DiskRemoveRequested, DiskRemoving] sticky false,
        DiskAdding(3) "DISK_ADDING" requires [DiskAddRequested] forbids [Delete] sticky false,
        DiskRemoveRequested(4) "DISK_REMOVE_REQUESTED" requires []
            forbids [Delete, Diskless, DiskAddRequested, DiskAdding] sticky false,
        DiskRemoving(5) "DISK_REMOVING" requires [DiskRemoveRequested] forbids [Delete] sticky false,
        TieBreaker(6) "TIE_BREAKER" requires [Diskless] forbids [Delete] sticky false,
        Inactive(7) "INACTIVE" requires [] forbids [] sticky false,
        Inactivating(8) "INACTIVATING" requires [Inactive] forbids [Delete] sticky false,
        Reactivate(9) "REACTIVATE" requires [] forbids [Inactive, Delete] sticky false,
    }
}

lifecycle_flags! {
    pub enum VolumeFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        Resize(1) "RESIZE" requires [] forbids [Delete] sticky false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub rsc_name: ResourceName,
    pub flags: StateFlags<ResourceFlag>,
    pub props: Props,
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub volumes: BTreeMap<VolumeNumber, Volume>,
}

impl Resource {
    pub fn new(node_name: NodeName, rsc_name: ResourceName, flags: StateFlags<ResourceFlag>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            node_name,
            rsc_name,
            flags,
            props: Props::new(),
            created_at: Utc::now(),
            volumes: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.node_name, self.rsc_name)
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(ResourceFlag::Delete)
    }

    pub fn is_diskless(&self) -> bool {
        self.flags.is_set(ResourceFlag::Diskless)
    }

    /// Diskful and not on its way out
    pub fn is_active_diskful(&self) -> bool {
        !self.is_diskless() && !self.flags.is_any_set(&[ResourceFlag::Delete, ResourceFlag::DiskRemoving])
    }

    pub fn is_tie_breaker(&self) -> bool {
        self.flags.is_set(ResourceFlag::TieBreaker)
    }

    /// A disk toggle is in one of its intermediate steps
    pub fn is_toggling_disk(&self) -> bool {
        self.flags.is_any_set(&[
            ResourceFlag::DiskAddRequested,
            ResourceFlag::DiskAdding,
            ResourceFlag::DiskRemoveRequested,
            ResourceFlag::DiskRemoving,
        ])
    }

    pub fn is_inactive(&self) -> bool {
        self.flags.is_set(ResourceFlag::Inactive)
    }

    /// Deactivation or reactivation still waits for the satellites
    pub fn is_changing_activation(&self) -> bool {
        self.flags.is_any_set(&[ResourceFlag::Inactivating, ResourceFlag::Reactivate])
    }

    pub fn api_view(&self, in_use: Option<bool>) -> ResourceApi {
        ResourceApi {
            uuid: self.uuid,
            node_name: self.node_name.to_string(),
            name: self.rsc_name.to_string(),
            flags: self.flags.names(),
            props: self.props.to_map(),
            in_use,
            volumes: self
                .volumes
                .values()
                .map(|v| VolumeApi {
                    number: v.number.value(),
                    stor_pool: v.stor_pool.as_ref().map(ToString::to_string),
                    flags: v.flags.names(),
                })
                .collect(),
        }
    }
}

impl Persistable for Resource {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Resource,
            self.key(),
            self.flags.bits(),
            &self.props,
            self,
            &["volumes"],
        )?);
        for vlm in self.volumes.values() {
            vlm.collect_rows(rows)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub rsc_name: ResourceName,
    pub number: VolumeNumber,
    /// Backing pool; `None` for diskless volumes
    pub stor_pool: Option<StorPoolName>,
    pub flags: StateFlags<VolumeFlag>,
    pub props: Props,
}

impl Volume {
    pub fn new(
        node_name: NodeName,
        rsc_name: ResourceName,
        number: VolumeNumber,
        stor_pool: Option<StorPoolName>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            node_name,
            rsc_name,
            number,
            stor_pool,
            flags: StateFlags::empty(),
            props: Props::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.node_name, self.rsc_name, self.number)
    }
}

impl Persistable for Volume {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Volume,
            self.key(),
            self.flags.bits(),
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeApi {
    pub number: u32,
    pub stor_pool: Option<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceApi {
    pub uuid: Uuid,
    pub node_name: String,
    pub name: String,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
    /// As last reported by the satellite
    pub in_use: Option<bool>,
    pub volumes: Vec<VolumeApi>,
}
