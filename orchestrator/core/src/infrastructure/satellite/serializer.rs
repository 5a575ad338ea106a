// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::errors::ApiError;
use crate::domain::satellite::{StateSerializer, UpdateContent};
use bytes::Bytes;

/// Encodes update content as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStateSerializer;

impl StateSerializer for JsonStateSerializer {
    fn serialize(&self, content: &UpdateContent) -> Result<Bytes, ApiError> {
        serde_json::to_vec(content).map(Bytes::from).map_err(|e| {
            ApiError::implementation(format!("failed to serialize {}: {}", content.describe(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::names::NodeName;

    #[test]
    fn test_serializes_tagged_content() {
        let body = JsonStateSerializer
            .serialize(&UpdateContent::NodeDeleted {
                node_name: NodeName::new("alpha").unwrap(),
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["kind"], "node_deleted");
        assert_eq!(value["node_name"], "alpha");
    }
}
