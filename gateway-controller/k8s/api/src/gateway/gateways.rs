use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU16;

/// A shared network entry point exposing one or more listeners.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    plural = "gateways",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,

    #[serde(default)]
    pub listeners: Vec<Listener>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: NonZeroU16,
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Gateway {
    /// Finds the listener named `section_name`. Listener names are expected to
    /// be unique; when they are not, the last listener with the name wins.
    pub fn listener(&self, section_name: &str) -> Option<&Listener> {
        self.spec
            .listeners
            .iter()
            .rev()
            .find(|l| l.name == section_name)
    }
}
