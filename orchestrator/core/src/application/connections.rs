// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Connection Handler
//!
//! Node, resource and volume connections share one handler; the
//! [`ConnectionRef`] level decides the lock set and which satellites hear
//! about the change.

use crate::application::context::{change_report, flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::connection::{ordered_pair, ConnectionApi, NodeConnection, ResourceConnection, VolumeConnection};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName, VolumeNumber};
use crate::domain::props::{Props, PropsChange};
use crate::domain::resource_definition::ResourceDefinition;
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum ConnectionRef {
    Node {
        node_a: NodeName,
        node_b: NodeName,
    },
    Resource {
        rsc_name: ResourceName,
        node_a: NodeName,
        node_b: NodeName,
    },
    Volume {
        rsc_name: ResourceName,
        node_a: NodeName,
        node_b: NodeName,
        volume: VolumeNumber,
    },
}

impl ConnectionRef {
    fn nodes(&self) -> (&NodeName, &NodeName) {
        match self {
            ConnectionRef::Node { node_a, node_b }
            | ConnectionRef::Resource { node_a, node_b, .. }
            | ConnectionRef::Volume { node_a, node_b, .. } => (node_a, node_b),
        }
    }

    fn pair(&self) -> (NodeName, NodeName) {
        let (a, b) = self.nodes();
        ordered_pair(a.clone(), b.clone())
    }

    fn locks(&self) -> LockRequest {
        match self {
            ConnectionRef::Node { .. } => LockRequest::new().write(&[LockObj::Nodes]),
            _ => LockRequest::new()
                .read(&[LockObj::Nodes])
                .write(&[LockObj::ResourceDefinitions]),
        }
    }

    fn denied_code(&self) -> ReturnCode {
        match self {
            ConnectionRef::Node { .. } => ReturnCode::FAIL_ACC_DENIED_NODE,
            _ => ReturnCode::FAIL_ACC_DENIED_RSC,
        }
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRef::Node { node_a, node_b } => {
                write!(f, "node connection '{}' <-> '{}'", node_a, node_b)
            }
            ConnectionRef::Resource {
                rsc_name,
                node_a,
                node_b,
            } => write!(
                f,
                "resource connection '{}' on '{}' <-> '{}'",
                rsc_name, node_a, node_b
            ),
            ConnectionRef::Volume {
                rsc_name,
                node_a,
                node_b,
                volume,
            } => write!(
                f,
                "volume connection '{}/{}' on '{}' <-> '{}'",
                rsc_name, volume, node_a, node_b
            ),
        }
    }
}

pub struct ConnectionHandler {
    ctx: Arc<ControllerContext>,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(
        &self,
        principal: &Principal,
        conn: ConnectionRef,
        props: BTreeMap<String, String>,
    ) -> ApiResponse {
        let response = ResponseContext::new("creating", conn.to_string());
        let stream = flow(
            principal
                .require(AccessType::Change, conn.denied_code(), "create connection")
                .map(|()| {
                    let target = conn.clone();
                    let create = self.ctx.step(
                        format!("create {}", conn),
                        conn.locks(),
                        move |tx| create_connection(tx, &target, props),
                    );
                    sequence(vec![create, self.deploy(&conn)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn modify(&self, principal: &Principal, conn: ConnectionRef, change: PropsChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", conn.to_string());
        let stream = flow(
            principal
                .require(AccessType::Change, conn.denied_code(), "modify connection")
                .map(|()| {
                    let target = conn.clone();
                    let modify = self.ctx.step(
                        format!("modify {}", conn),
                        conn.locks(),
                        move |tx| {
                            let changed = change.apply_to(connection_props_mut(tx, &target)?)?;
                            Ok(change_report(changed, format!("Modified {}", target)))
                        },
                    );
                    sequence(vec![modify, self.deploy(&conn)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, conn: ConnectionRef) -> ApiResponse {
        let response = ResponseContext::new("deleting", conn.to_string());
        let stream = flow(
            principal
                .require(AccessType::Change, conn.denied_code(), "delete connection")
                .map(|()| {
                    let target = conn.clone();
                    let delete = self.ctx.step(
                        format!("delete {}", conn),
                        conn.locks(),
                        move |tx| delete_connection(tx, &target),
                    );
                    sequence(vec![delete, self.deploy(&conn)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<ConnectionApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_NODE, "list connections")?;
        let state = self.ctx.store.snapshot();
        let mut out: Vec<ConnectionApi> = state.nodes.connections.values().map(ConnectionApi::from).collect();
        for dfn in state.rsc_dfns.values() {
            for conn in dfn.connections.values() {
                out.push(ConnectionApi::from(conn));
                out.extend(conn.volume_conns.values().map(ConnectionApi::from));
            }
        }
        Ok(out)
    }

    /// Node connections go to both nodes; the others redeploy the definition
    fn deploy(&self, conn: &ConnectionRef) -> RcStream {
        match conn {
            ConnectionRef::Node { node_a, node_b } => sequence(
                [node_a, node_b]
                    .into_iter()
                    .map(|node| {
                        self.ctx.notify(
                            format!("update node '{}'", node),
                            UpdateTarget::Node(node.clone()),
                            DeploymentMessages::new(format!("node '{}'", node)),
                        )
                    })
                    .collect(),
            ),
            ConnectionRef::Resource { rsc_name, .. } | ConnectionRef::Volume { rsc_name, .. } => {
                self.ctx.propagate(
                    format!("update resource definition '{}'", rsc_name),
                    UpdateTarget::ResourceDefinition(rsc_name.clone()),
                    DeploymentMessages::new(format!("resource definition '{}'", rsc_name))
                        .success("Updated connections of {object} on '{node}'"),
                )
            }
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

fn check_distinct(conn: &ConnectionRef) -> Result<(), ApiError> {
    let (a, b) = conn.nodes();
    if a == b {
        return Err(ApiError::entry(
            RcEntry::new(ReturnCode::FAIL_INVLD_NAME, format!("Invalid {}", conn))
                .with_cause("a connection needs two different nodes"),
        ));
    }
    Ok(())
}

fn definition_mut<'t>(tx: &'t mut Transaction, rsc_name: &ResourceName) -> Result<&'t mut ResourceDefinition, ApiError> {
    tx.rsc_dfns_mut()?
        .get_mut(rsc_name)
        .filter(|dfn| !dfn.is_deleting())
        .ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
                format!("Resource definition '{}' not found", rsc_name),
            )
        })
}

fn check_resources(dfn: &ResourceDefinition, conn: &ConnectionRef) -> Result<(), ApiError> {
    let (a, b) = conn.nodes();
    for node in [a, b] {
        let rsc = dfn.resources.get(node).ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC,
                format!("Resource '{}' is not deployed on node '{}'", dfn.name, node),
            )
        })?;
        if let ConnectionRef::Volume { volume, .. } = conn {
            if !rsc.volumes.contains_key(volume) {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_NOT_FOUND_VLM,
                    format!("Volume {} of '{}' not found on node '{}'", volume, dfn.name, node),
                ));
            }
        }
    }
    Ok(())
}

fn create_connection(
    tx: &mut Transaction,
    conn: &ConnectionRef,
    props: BTreeMap<String, String>,
) -> Result<ApiCallRc, ApiError> {
    check_distinct(conn)?;
    let props = Props::from_pairs(props)?;
    let pair = conn.pair();
    match conn {
        ConnectionRef::Node { node_a, node_b } => {
            for node in [node_a, node_b] {
                if !tx.nodes()?.nodes.get(node).map_or(false, |n| !n.is_deleting()) {
                    return Err(ApiError::rc(
                        ReturnCode::FAIL_NOT_FOUND_NODE,
                        format!("Node '{}' not found", node),
                    ));
                }
            }
            let tables = tx.nodes_mut()?;
            if tables.connections.contains_key(&pair) {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_EXISTS_NODE_CONN,
                    format!("The {} already exists", conn),
                ));
            }
            let mut created = NodeConnection::new(node_a.clone(), node_b.clone());
            created.props = props;
            tables.connections.insert(pair, created);
        }
        ConnectionRef::Resource {
            rsc_name,
            node_a,
            node_b,
        } => {
            let dfn = definition_mut(tx, rsc_name)?;
            check_resources(dfn, conn)?;
            if dfn.connections.contains_key(&pair) {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_EXISTS_RSC_CONN,
                    format!("The {} already exists", conn),
                ));
            }
            let mut created = ResourceConnection::new(rsc_name.clone(), node_a.clone(), node_b.clone());
            created.props = props;
            dfn.connections.insert(pair, created);
        }
        ConnectionRef::Volume {
            rsc_name,
            node_a,
            node_b,
            volume,
        } => {
            let dfn = definition_mut(tx, rsc_name)?;
            check_resources(dfn, conn)?;
            // the enclosing resource connection is implied
            let rsc_conn = dfn
                .connections
                .entry(pair)
                .or_insert_with(|| ResourceConnection::new(rsc_name.clone(), node_a.clone(), node_b.clone()));
            if rsc_conn.volume_conns.contains_key(volume) {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_EXISTS_VLM,
                    format!("The {} already exists", conn),
                ));
            }
            let mut created = VolumeConnection::new(rsc_name.clone(), node_a.clone(), node_b.clone(), *volume);
            created.props = props;
            rsc_conn.volume_conns.insert(*volume, created);
        }
    }
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::CREATED,
        format!("Created {}", conn),
    )))
}

fn not_found(conn: &ConnectionRef) -> ApiError {
    let code = match conn {
        ConnectionRef::Node { .. } => ReturnCode::FAIL_NOT_FOUND_NODE_CONN,
        _ => ReturnCode::FAIL_NOT_FOUND_RSC_CONN,
    };
    ApiError::rc(code, format!("The {} does not exist", conn))
}

fn connection_props_mut<'t>(tx: &'t mut Transaction, conn: &ConnectionRef) -> Result<&'t mut Props, ApiError> {
    let pair = conn.pair();
    match conn {
        ConnectionRef::Node { .. } => tx
            .nodes_mut()?
            .connections
            .get_mut(&pair)
            .map(|c| &mut c.props)
            .ok_or_else(|| not_found(conn)),
        ConnectionRef::Resource { rsc_name, .. } => definition_mut(tx, rsc_name)?
            .connections
            .get_mut(&pair)
            .map(|c| &mut c.props)
            .ok_or_else(|| not_found(conn)),
        ConnectionRef::Volume { rsc_name, volume, .. } => definition_mut(tx, rsc_name)?
            .connections
            .get_mut(&pair)
            .and_then(|c| c.volume_conns.get_mut(volume))
            .map(|c| &mut c.props)
            .ok_or_else(|| not_found(conn)),
    }
}

fn delete_connection(tx: &mut Transaction, conn: &ConnectionRef) -> Result<ApiCallRc, ApiError> {
    let pair = conn.pair();
    let removed = match conn {
        ConnectionRef::Node { .. } => tx.nodes_mut()?.connections.remove(&pair).is_some(),
        ConnectionRef::Resource { rsc_name, .. } => tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .map_or(false, |dfn| dfn.connections.remove(&pair).is_some()),
        ConnectionRef::Volume { rsc_name, volume, .. } => tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .and_then(|dfn| dfn.connections.get_mut(&pair))
            .map_or(false, |c| c.volume_conns.remove(volume).is_some()),
    };
    if !removed {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("The {} does not exist", conn),
        ));
    }
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Deleted {}", conn),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::ResourceGroupName;
    use crate::domain::node::{Node, NodeType};
    use crate::domain::resource::Resource;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn name(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    fn rsc() -> ResourceName {
        ResourceName::new("r1").unwrap()
    }

    fn transaction() -> (Arc<ObjectStore>, Transaction) {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        tx.attach(LockObj::Nodes, LockMode::Write);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        for n in ["a", "b"] {
            tx.nodes_mut()
                .unwrap()
                .nodes
                .insert(name(n), Node::new(name(n), NodeType::Satellite));
        }
        let mut dfn = ResourceDefinition::new(rsc(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        for n in ["a", "b"] {
            dfn.resources
                .insert(name(n), Resource::new(name(n), rsc(), StateFlags::empty()));
        }
        tx.rsc_dfns_mut().unwrap().insert(rsc(), dfn);
        (store, tx)
    }

    #[test]
    fn test_node_connection_lifecycle() {
        let (_store, mut tx) = transaction();
        let conn = ConnectionRef::Node {
            node_a: name("b"),
            node_b: name("a"),
        };
        create_connection(&mut tx, &conn, BTreeMap::new()).unwrap();
        assert!(tx.nodes().unwrap().connections.contains_key(&(name("a"), name("b"))));

        let reversed = ConnectionRef::Node {
            node_a: name("a"),
            node_b: name("b"),
        };
        let err = create_connection(&mut tx, &reversed, BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_NODE_CONN);

        let changed = PropsChange::new()
            .set("DrbdOptions/Net/protocol", "A")
            .apply_to(connection_props_mut(&mut tx, &reversed).unwrap())
            .unwrap();
        assert!(changed);

        delete_connection(&mut tx, &conn).unwrap();
        let err = delete_connection(&mut tx, &conn).unwrap_err();
        assert_eq!(err.code(), ReturnCode::WARN_NOT_FOUND);
    }

    #[test]
    fn test_connection_to_self_is_invalid() {
        let (_store, mut tx) = transaction();
        let conn = ConnectionRef::Node {
            node_a: name("a"),
            node_b: name("a"),
        };
        let err = create_connection(&mut tx, &conn, BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_NAME);
    }

    #[test]
    fn test_resource_connection_needs_both_resources() {
        let (_store, mut tx) = transaction();
        tx.nodes_mut()
            .unwrap()
            .nodes
            .insert(name("c"), Node::new(name("c"), NodeType::Satellite));
        let conn = ConnectionRef::Resource {
            rsc_name: rsc(),
            node_a: name("a"),
            node_b: name("c"),
        };
        let err = create_connection(&mut tx, &conn, BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_FOUND_RSC);

        let missing = ConnectionRef::Resource {
            rsc_name: rsc(),
            node_a: name("a"),
            node_b: name("b"),
        };
        let err = connection_props_mut(&mut tx, &missing).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_FOUND_RSC_CONN);
        create_connection(&mut tx, &missing, BTreeMap::new()).unwrap();
        assert!(connection_props_mut(&mut tx, &missing).is_ok());
    }

    #[test]
    fn test_volume_connection_requires_volume() {
        let (_store, mut tx) = transaction();
        let conn = ConnectionRef::Volume {
            rsc_name: rsc(),
            node_a: name("a"),
            node_b: name("b"),
            volume: VolumeNumber::new(0).unwrap(),
        };
        let err = create_connection(&mut tx, &conn, BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_FOUND_VLM);
    }
}
