//! The `PolycubeNetworkPolicy` custom resource (`polycube.network/v1beta`).
//!
//! Unlike most custom resources, the target and the priority live next to `spec`, so the type
//! implements [`kube::Resource`] itself.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{NamespaceResourceScope, Resource};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap as Map;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolycubeNetworkPolicy {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub apply_to: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub spec: PolicySpec,
}

impl Resource for PolycubeNetworkPolicy {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "PolycubeNetworkPolicy".into()
    }
    fn group(_: &()) -> Cow<'_, str> {
        "polycube.network".into()
    }
    fn version(_: &()) -> Cow<'_, str> {
        "v1beta".into()
    }
    fn plural(_: &()) -> Cow<'_, str> {
        "polycubenetworkpolicies".into()
    }
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Pod,
    Service,
    #[serde(other)]
    Unknown,
}

/// What the policy applies to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub target: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_labels: Option<Map<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub ingress_rules: IngressRules,
    #[serde(default)]
    pub egress_rules: EgressRules,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_all: Option<bool>,
    /// only reach the subject through its service (not enforced yet)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevent_direct_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<IngressRule>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<EgressRule>>,
}

/// Common view of both rule containers.
pub trait RuleContainer {
    fn drop_all(&self) -> bool;
    fn allow_all(&self) -> bool;
    fn rules(&self) -> Vec<(&Peer, &[ProtocolContainer], Option<&str>)>;

    fn is_filled(&self) -> bool {
        self.drop_all() || self.allow_all() || !self.rules().is_empty()
    }
}

impl RuleContainer for IngressRules {
    fn drop_all(&self) -> bool {
        self.drop_all == Some(true)
    }
    fn allow_all(&self) -> bool {
        self.allow_all == Some(true)
    }
    fn rules(&self) -> Vec<(&Peer, &[ProtocolContainer], Option<&str>)> {
        (self.rules.iter().flatten())
            .map(|r| (&r.from, r.protocols.as_slice(), r.action.as_deref()))
            .collect()
    }
}

impl RuleContainer for EgressRules {
    fn drop_all(&self) -> bool {
        self.drop_all == Some(true)
    }
    fn allow_all(&self) -> bool {
        self.allow_all == Some(true)
    }
    fn rules(&self) -> Vec<(&Peer, &[ProtocolContainer], Option<&str>)> {
        (self.rules.iter().flatten())
            .map(|r| (&r.to, r.protocols.as_slice(), r.action.as_deref()))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default)]
    pub from: Peer,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<ProtocolContainer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[serde(default)]
    pub to: Peer,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<ProtocolContainer>,
    /// accepted for compatibility, the backend rules carry no flags
    #[serde(default, rename = "tcpflags", skip_serializing_if = "Vec::is_empty")]
    pub tcp_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    #[default]
    Pod,
    World,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(default)]
    pub peer: PeerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_labels: Option<Map<String, String>>,
    #[serde(default, rename = "withIP", skip_serializing_if = "Option::is_none")]
    pub with_ip: Option<WithIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_namespace: Option<NamespaceSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WithIp {
    #[serde(default)]
    pub list: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_labels: Option<Map<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolContainer {
    #[serde(default)]
    pub ports: Ports,
    /// `tcp`, `udp` or `icmp`
    #[serde(default)]
    pub protocol: String,
}

/// `0` means any port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default)]
    pub source: i32,
    #[serde(default)]
    pub destination: i32,
}
