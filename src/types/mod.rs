// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resource types stored in the hub and managed clusters.

pub mod cluster;
pub mod cluster_permission;
pub mod cluster_status;
pub mod join_request;
pub mod legacy;
pub mod resource_view;
pub mod work;
pub mod workset;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Schema for embedded objects whose shape is owned by someone else.
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject::default();
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Schema for base64 encoded `ByteString` fields.
pub(crate) fn byte_string(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        format: Some("byte".to_string()),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn spec_schema<K: CustomResourceExt>() -> serde_json::Value {
        let crd = serde_json::to_value(K::crd()).unwrap();
        crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"].clone()
    }

    #[test]
    fn test_byte_string_fields_are_base64_strings() {
        let join = spec_schema::<join_request::ClusterJoinRequest>();
        let request = &join["properties"]["spec"]["properties"]["request"];
        assert_eq!(request["type"], "string");
        assert_eq!(request["format"], "byte");
        let certificate = &join["properties"]["status"]["properties"]["certificate"];
        assert_eq!(certificate["format"], "byte");

        let status = spec_schema::<cluster_status::ClusterStatus>();
        assert_eq!(status["properties"]["spec"]["properties"]["klusterletCA"]["format"], "byte");
    }

    #[test]
    fn test_every_kind_has_a_schema() {
        for schema in [
            spec_schema::<cluster::Cluster>(),
            spec_schema::<cluster_permission::ClusterPermission>(),
            spec_schema::<cluster_status::ClusterStatus>(),
            spec_schema::<join_request::ClusterJoinRequest>(),
            spec_schema::<resource_view::ResourceView>(),
            spec_schema::<work::Work>(),
            spec_schema::<workset::WorkSet>(),
        ] {
            assert_eq!(schema["type"], "object");
            assert!(schema["properties"]["spec"].is_object());
        }
    }
}
