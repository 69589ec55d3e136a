//! Projects, forward definitions and runtime forward records.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::protocol::ForwardId;

/// Namespace used when a forward doesn't name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// A named, ordered collection of forwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Remote context used by forwards that don't name their own
    pub context: String,
    /// Projects sharing a staging group never run at the same time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_group: Option<String>,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

impl Project {
    pub fn new(name: &str, context: &str) -> Self {
        Self {
            name: name.to_string(),
            context: context.to_string(),
            staging_group: None,
            forwards: Vec::new(),
        }
    }

    pub fn with_staging_group(mut self, group: &str) -> Self {
        self.staging_group = Some(group.to_string());
        self
    }

    pub fn with_forward(mut self, forward: ForwardSpec) -> Self {
        self.forwards.push(forward);
        self
    }
}

/// One local-port-to-remote-target tunnel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Human name; the target name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Pod to forward to
    pub target: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Overrides the project's context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub remote_port: u16,
    pub local_port: u16,
}

fn default_kind() -> String {
    "pod".to_string()
}

impl ForwardSpec {
    pub fn new(target: &str, remote_port: u16, local_port: u16) -> Self {
        Self {
            name: None,
            target: target.to_string(),
            kind: default_kind(),
            context: None,
            namespace: None,
            remote_port,
            local_port,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.target)
    }

    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn context_name<'a>(&'a self, project: &'a Project) -> &'a str {
        self.context.as_deref().unwrap_or(&project.context)
    }
}

/// Identity of a forward independent of its runtime id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub project: String,
    pub name: String,
    pub kind: String,
    pub namespace: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl NaturalKey {
    pub fn new(project: &str, spec: &ForwardSpec) -> Self {
        Self {
            project: project.to_string(),
            name: spec.display_name().to_string(),
            kind: spec.kind.clone(),
            namespace: spec.namespace().to_string(),
            remote_port: spec.remote_port,
            local_port: spec.local_port,
        }
    }
}

/// Registry record of a forward whose listener is bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveForward {
    pub id: ForwardId,
    pub project: String,
    pub name: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub context: String,
    pub namespace: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// Address actually bound, useful when `local_port` is 0
    pub local_addr: SocketAddr,
}

impl ActiveForward {
    pub fn new(
        id: ForwardId,
        project: &Project,
        spec: &ForwardSpec,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            project: project.name.clone(),
            name: spec.display_name().to_string(),
            target: spec.target.clone(),
            kind: spec.kind.clone(),
            context: spec.context_name(project).to_string(),
            namespace: spec.namespace().to_string(),
            remote_port: spec.remote_port,
            local_port: spec.local_port,
            local_addr,
        }
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            project: self.project.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            remote_port: self.remote_port,
            local_port: self.local_port,
        }
    }
}
