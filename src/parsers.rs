//! Policy parsers: one policy object in, ordered [`ParsedPolicy`] records out.

pub mod k8s;
pub mod pcn;

use crate::{
    cluster::ServiceInfo,
    crd::{PolycubeNetworkPolicy, TargetKind},
    keys,
    resolver,
    types::{ParsedPolicy, Provider},
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::fmt;
use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported subject: {0}")]
    UnsupportedSubject(#[source] resolver::Error),
    #[error("unsupported target kind")]
    UnsupportedTarget,
    #[error("policy has no namespace")]
    MissingNamespace,
    #[error("service target has no name")]
    MissingServiceName,
    #[error("service {0} not found")]
    MissingService(String),
    #[error("service {0} has no selector")]
    EmptyServiceSelector(String),
}

/// A policy of either dialect.
#[derive(Clone, Debug)]
pub enum Policy {
    K8s(Arc<NetworkPolicy>),
    Pcn(Arc<PolycubeNetworkPolicy>),
}

impl Policy {
    pub fn provider(&self) -> Provider {
        match self {
            Policy::K8s(_) => Provider::K8s,
            Policy::Pcn(_) => Provider::Pcn,
        }
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Policy::K8s(p) => &p.metadata,
            Policy::Pcn(p) => &p.metadata,
        }
    }

    pub fn key(&self) -> Option<keys::Object> {
        keys::Object::try_from(self.meta()).ok()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    /// Name of the service the policy applies to, if it targets one.
    pub fn service_target(&self) -> Result<Option<&str>> {
        let Policy::Pcn(p) = self else {
            return Ok(None);
        };
        match p.apply_to.target {
            TargetKind::Pod => Ok(None),
            TargetKind::Service => match p.apply_to.with_name.as_deref() {
                Some(name) if !name.is_empty() => Ok(Some(name)),
                _ => Err(Error::MissingServiceName),
            },
            TargetKind::Unknown => Err(Error::UnsupportedTarget),
        }
    }

    /// Parses both directions, incoming records first. `service` is the targeted service, if any.
    pub fn parse(&self, service: Option<&ServiceInfo>) -> Result<Vec<ParsedPolicy>> {
        match self {
            Policy::K8s(p) => k8s::parse(p),
            Policy::Pcn(p) => pcn::parse(p, service),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{} policy {key}", self.provider()),
            None => write!(f, "{} policy without name", self.provider()),
        }
    }
}
