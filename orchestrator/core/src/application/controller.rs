// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Controller
//!
//! Wires the object store, satellite registry and every API handler into one
//! running controller.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Composition root used by the CLI and integration tests
//!
//! Startup order:
//! 1. Select the persistence driver and load the object store
//! 2. Build the shared [`ControllerContext`] and the handlers
//! 3. Register resumption listeners with the connection notifier
//! 4. Create the default resource group if the store is new
//! 5. Start reacting to satellites coming online

use crate::application::backups::BackupHandler;
use crate::application::connection_notifier::ConnectionListener;
use crate::application::connections::ConnectionHandler;
use crate::application::context::ControllerContext;
use crate::application::controller_props::ControllerPropsHandler;
use crate::application::external_files::ExternalFileHandler;
use crate::application::nodes::NodeHandler;
use crate::application::remotes::RemoteHandler;
use crate::application::resource_definitions::ResourceDefinitionHandler;
use crate::application::resource_groups::{ensure_default_group, ResourceGroupHandler};
use crate::application::resources::ResourceHandler;
use crate::application::schedules::ScheduleHandler;
use crate::application::snapshot_restore::SnapshotRestoreHandler;
use crate::application::snapshot_shipping::SnapshotShippingHandler;
use crate::application::snapshots::SnapshotHandler;
use crate::application::storage_pools::StorPoolHandler;
use crate::application::volume_definitions::VolumeDefinitionHandler;
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::controller_config::{ControllerConfigSpec, PersistenceConfig};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::repository::PersistenceDriver;
use crate::infrastructure::db::Database;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::number_pools::NumberPools;
use crate::infrastructure::object_store::ObjectStore;
use crate::infrastructure::repositories::{InMemoryPersistence, PostgresPersistence};
use crate::infrastructure::satellite::{JsonStateSerializer, SatelliteRegistry};
use anyhow::Context;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Controller {
    pub ctx: Arc<ControllerContext>,
    pub nodes: Arc<NodeHandler>,
    pub resources: Arc<ResourceHandler>,
    pub resource_definitions: Arc<ResourceDefinitionHandler>,
    pub volume_definitions: Arc<VolumeDefinitionHandler>,
    pub storage_pools: Arc<StorPoolHandler>,
    pub snapshots: Arc<SnapshotHandler>,
    pub snapshot_shipping: Arc<SnapshotShippingHandler>,
    pub snapshot_restore: Arc<SnapshotRestoreHandler>,
    pub backups: Arc<BackupHandler>,
    pub remotes: Arc<RemoteHandler>,
    pub schedules: Arc<ScheduleHandler>,
    pub external_files: Arc<ExternalFileHandler>,
    pub resource_groups: Arc<ResourceGroupHandler>,
    pub connections: Arc<ConnectionHandler>,
    pub controller_props: Arc<ControllerPropsHandler>,
    notifier_task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Loads the store from the configured backend and builds the controller
    pub async fn bootstrap(spec: &ControllerConfigSpec) -> anyhow::Result<Arc<Self>> {
        let driver: Arc<dyn PersistenceDriver> = match &spec.persistence {
            PersistenceConfig::InMemory => {
                info!("Using in-memory persistence");
                Arc::new(InMemoryPersistence::new())
            }
            PersistenceConfig::Postgres { url } => {
                let db = Database::new(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                let postgres = PostgresPersistence::new(db.get_pool().clone());
                postgres
                    .ensure_schema()
                    .await
                    .context("Failed to prepare the stork schema")?;
                info!("Using PostgreSQL persistence");
                Arc::new(postgres)
            }
        };
        let event_bus = EventBus::new(spec.observability.event_bus_capacity);
        let pools = Arc::new(NumberPools::new(&spec.number_pools));
        let store = ObjectStore::load(driver, pools, event_bus.clone())
            .await
            .context("Failed to load the object store")?;
        let registry = Arc::new(SatelliteRegistry::new(event_bus.clone()));

        let controller = Self::new(store, registry, event_bus, spec);
        controller
            .ensure_defaults()
            .await
            .context("Failed to create default objects")?;
        Ok(controller)
    }

    /// Builds the handlers around an already loaded store
    pub fn new(
        store: Arc<ObjectStore>,
        registry: Arc<SatelliteRegistry>,
        event_bus: EventBus,
        spec: &ControllerConfigSpec,
    ) -> Arc<Self> {
        let ctx = ControllerContext::new(
            store,
            registry,
            Arc::new(JsonStateSerializer),
            event_bus,
            spec.satellite_timeout(),
            spec.max_concurrent_operations,
        );

        let resources = ResourceHandler::new(Arc::clone(&ctx));
        let snapshots = SnapshotHandler::new(Arc::clone(&ctx));
        let controller = Arc::new(Self {
            nodes: NodeHandler::new(Arc::clone(&ctx), Arc::clone(&resources)),
            resource_definitions: ResourceDefinitionHandler::new(Arc::clone(&ctx), Arc::clone(&resources)),
            volume_definitions: VolumeDefinitionHandler::new(Arc::clone(&ctx)),
            storage_pools: StorPoolHandler::new(Arc::clone(&ctx)),
            backups: BackupHandler::new(Arc::clone(&ctx), Arc::clone(&snapshots)),
            snapshot_shipping: SnapshotShippingHandler::new(Arc::clone(&ctx), Arc::clone(&snapshots)),
            snapshot_restore: SnapshotRestoreHandler::new(Arc::clone(&ctx)),
            remotes: RemoteHandler::new(Arc::clone(&ctx)),
            schedules: ScheduleHandler::new(Arc::clone(&ctx)),
            external_files: ExternalFileHandler::new(Arc::clone(&ctx)),
            resource_groups: ResourceGroupHandler::new(Arc::clone(&ctx)),
            connections: ConnectionHandler::new(Arc::clone(&ctx)),
            controller_props: ControllerPropsHandler::new(Arc::clone(&ctx)),
            resources,
            snapshots,
            ctx,
            notifier_task: Mutex::new(None),
        });
        controller.register_listeners();
        controller
    }

    /// Definition-level flows run before the resource-level ones
    fn register_listeners(&self) {
        let listeners: [Arc<dyn ConnectionListener>; 8] = [
            self.resource_definitions.clone(),
            self.resources.clone(),
            self.volume_definitions.clone(),
            self.snapshots.clone(),
            self.snapshot_restore.clone(),
            self.backups.clone(),
            self.remotes.clone(),
            self.external_files.clone(),
        ];
        for listener in &listeners {
            self.ctx.notifier.register(listener);
        }
        info!(count = listeners.len(), "Resumption listeners registered");
    }

    /// Creates the objects every controller needs
    pub async fn ensure_defaults(&self) -> Result<(), ApiError> {
        let batches: Vec<ApiCallRc> = self
            .ctx
            .step(
                "ensure default objects",
                LockRequest::new().write(&[LockObj::ResourceGroups]),
                |tx| {
                    let created = ensure_default_group(tx)?;
                    Ok(if created {
                        ApiCallRc::single(RcEntry::new(
                            ReturnCode::CREATED,
                            "Default resource group created",
                        ))
                    } else {
                        ApiCallRc::new()
                    })
                },
            )
            .try_collect()
            .await?;
        if batches.iter().any(|rc| rc.contains(ReturnCode::CREATED)) {
            info!("Default resource group created");
        }
        Ok(())
    }

    /// Starts the connection notifier; calling it twice has no effect
    pub fn start(&self) {
        let mut task = self.notifier_task.lock();
        if task.is_none() {
            let cancel = self.ctx.background.cancellation_token();
            *task = Some(self.ctx.notifier.start(&self.ctx.event_bus, cancel));
            info!("Controller started");
        }
    }

    /// Stops follow-up operations and the notifier
    pub async fn shutdown(&self) {
        self.ctx.background.shutdown().await;
        let task = self.notifier_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::names::ResourceGroupName;
    use crate::domain::resource_definition::DEFAULT_RESOURCE_GROUP;

    #[tokio::test]
    async fn test_bootstrap_in_memory_creates_default_group() {
        let spec = ControllerConfigSpec::default();
        let controller = Controller::bootstrap(&spec).await.unwrap();
        let state = controller.ctx.store.snapshot();
        assert!(state
            .rsc_grps
            .contains_key(&ResourceGroupName::new(DEFAULT_RESOURCE_GROUP).unwrap()));

        controller.ensure_defaults().await.unwrap();
        assert_eq!(controller.ctx.store.snapshot().rsc_grps.len(), 1);

        controller.start();
        controller.start();
        controller.shutdown().await;
    }
}
