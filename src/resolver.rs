//! Peer resolution: from symbolic peers to concrete rules.

use crate::{
    cluster::{self, Cluster, PodInfo, ServiceInfo},
    sink::ChainRule,
    templates::fill_templates,
    types::{Direction, ObjectQuery, ParsedPolicy, Peer, labels_contained},
};
use cidr::{IpInet, Ipv4Cidr};
use futures::future::join_all;
use itertools::Itertools;
use k8s_openapi::api::networking::v1::IPBlock;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::debug;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported selector: {0}")]
    UnsupportedSelector(&'static str),
    #[error("peer has neither a selector nor an ip block")]
    EmptyPeer,
    #[error("invalid cidr {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },
    #[error("cluster query failed: {0}")]
    Cluster(#[from] cluster::Error),
}

/// Query equivalent to a label selector; `None` selects everything.
pub fn query_from_selector(selector: &LabelSelector) -> Result<Option<ObjectQuery>> {
    if selector.match_expressions.as_ref().is_some_and(|e| !e.is_empty()) {
        return Err(Error::UnsupportedSelector("match expressions"));
    }
    Ok(ObjectQuery::build(None, selector.match_labels.as_ref()))
}

/// Pod peer from the selectors of a policy peer. Without a namespace selector, pods are looked up
/// in the policy's own namespace.
pub fn peer_from_selectors(
    pods: Option<&LabelSelector>,
    namespaces: Option<&LabelSelector>,
    namespace: &str,
) -> Result<Peer> {
    let namespace = match (pods, namespaces) {
        (None, None) => return Err(Error::EmptyPeer),
        (_, Some(ns)) => query_from_selector(ns)?,
        (_, None) => Some(ObjectQuery::Name(namespace.to_string())),
    };
    let pods = match pods {
        Some(pods) => query_from_selector(pods)?,
        None => None,
    };
    Ok(Peer::Pods { pods, namespace })
}

fn check_cidr(cidr: &str) -> Result<()> {
    cidr.parse::<IpInet>()
        .map(|_| ())
        .map_err(|e| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Peers of an ip block: the exceptions (if any) then the block itself.
pub fn peer_from_ip_block(block: &IPBlock) -> Result<(Option<Peer>, Peer)> {
    check_cidr(&block.cidr)?;

    let except = block.except.clone().unwrap_or_default();
    for cidr in &except {
        check_cidr(cidr)?;
    }

    let except = (!except.is_empty()).then(|| Peer::IpBlock(except));
    Ok((except, Peer::IpBlock(vec![block.cidr.clone()])))
}

/// Address a pod is seen at after source NAT: the host part of its IP in the virtual range.
pub fn virtual_ip(vpods: &Ipv4Cidr, ip: &str) -> Option<String> {
    let ip: Ipv4Addr = ip.parse().ok()?;
    let mask = u32::from(vpods.mask());
    let network = u32::from(vpods.first_address());
    Some(Ipv4Addr::from((network & mask) | (u32::from(ip) & !mask)).to_string())
}

fn fill_for(direction: Direction, ip: &str, templates: &[ChainRule]) -> Vec<ChainRule> {
    match direction {
        Direction::Incoming => fill_templates(Some(ip), None, templates),
        Direction::Outgoing => fill_templates(None, Some(ip), templates),
    }
}

/// true if the service fronts pods selected by `query`.
fn service_matches(svc: &ServiceInfo, query: Option<&ObjectQuery>, pods: &[PodInfo]) -> bool {
    if svc.selector.is_empty() {
        return false;
    }
    match query {
        None => true,
        Some(ObjectQuery::Labels(labels)) => labels_contained(&svc.selector, labels),
        Some(ObjectQuery::Name(name)) => (pods.iter())
            .filter(|p| p.namespace == svc.namespace && &p.name == name)
            .any(|p| labels_contained(&svc.selector, &p.labels)),
    }
}

/// Templates as seen through the service: target ports become service ports, templates on a port
/// the service does not expose are dropped.
fn service_templates(svc: &ServiceInfo, templates: &[ChainRule]) -> Vec<ChainRule> {
    let mut out = Vec::new();
    for t in templates {
        let Some(dport) = t.dport else {
            out.push(t.clone());
            continue;
        };
        for port in &svc.ports {
            if port.target_port.unwrap_or(port.port) != dport {
                continue;
            }
            if let Some(ref proto) = t.l4proto
                && !proto.eq_ignore_ascii_case(&port.protocol)
            {
                continue;
            }
            out.push(ChainRule {
                dport: Some(port.port),
                ..t.clone()
            });
        }
    }
    out
}

pub struct Resolver<C> {
    cluster: Arc<C>,
    vpods: Option<Ipv4Cidr>,
}

impl<C> Clone for Resolver<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            vpods: self.vpods,
        }
    }
}

impl<C: Cluster> Resolver<C> {
    pub fn new(cluster: Arc<C>, vpods: Option<Ipv4Cidr>) -> Self {
        Self { cluster, vpods }
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    /// Concrete rules of a parsed policy, in evaluation order and without duplicates.
    pub async fn resolve(&self, policy: &ParsedPolicy) -> Result<Vec<ChainRule>> {
        if policy.action.is_all() {
            return Ok(policy.templates.clone());
        }

        let rules = match policy.peer {
            None => vec![],
            Some(Peer::IpBlock(ref ips)) => (ips.iter())
                .flat_map(|ip| fill_for(policy.direction, ip, &policy.templates))
                .collect(),
            Some(Peer::Pods {
                ref pods,
                ref namespace,
            }) => {
                self.resolve_pods(policy, pods.as_ref(), namespace.as_ref())
                    .await?
            }
        };

        Ok(rules.into_iter().unique().collect())
    }

    /// Resolves every policy independently.
    pub async fn resolve_all(&self, policies: &[Arc<ParsedPolicy>]) -> Vec<Result<Vec<ChainRule>>> {
        join_all(policies.iter().map(|p| self.resolve(p))).await
    }

    async fn resolve_pods(
        &self,
        policy: &ParsedPolicy,
        pods: Option<&ObjectQuery>,
        namespace: Option<&ObjectQuery>,
    ) -> Result<Vec<ChainRule>> {
        let namespaces = self.cluster.namespaces(namespace).await?;

        let found = join_all(
            (namespaces.iter()).map(|ns| self.cluster.pods(pods, &ns.name)),
        )
        .await;

        let mut peers = Vec::new();
        for result in found {
            peers.extend(result?);
        }
        debug!(
            "{}: {} peer pods in {} namespaces",
            policy.name,
            peers.len(),
            namespaces.len()
        );

        let mut rules = Vec::new();
        for pod in &peers {
            let Some(ref ip) = pod.ip else {
                continue;
            };
            rules.extend(fill_for(policy.direction, ip, &policy.templates));

            if policy.direction == Direction::Incoming
                && let Some(ref vpods) = self.vpods
                && let Some(vip) = virtual_ip(vpods, ip)
            {
                rules.extend(fill_for(policy.direction, &vip, &policy.templates));
            }
        }

        if policy.direction == Direction::Outgoing {
            let services = join_all(namespaces.iter().map(|ns| self.cluster.services(&ns.name))).await;
            for result in services {
                for svc in result? {
                    if !service_matches(&svc, pods, &peers) {
                        continue;
                    }
                    let Some(ref cluster_ip) = svc.cluster_ip else {
                        continue;
                    };
                    let templates = service_templates(&svc, &policy.templates);
                    rules.extend(fill_for(policy.direction, cluster_ip, &templates));
                }
            }
        }

        Ok(rules)
    }
}
