//! Parser of `PolycubeNetworkPolicy` objects.

use super::{Error, Result};
use crate::{
    cluster::ServiceInfo,
    crd::{self, PeerKind, PolycubeNetworkPolicy, ProtocolContainer, RuleContainer, TargetKind},
    sink::RuleAction,
    templates::build_rule_templates,
    types::{
        DEFAULT_PRIORITY, Direction, ObjectQuery, ParentPolicy, ParsedPolicy, Peer, PolicyAction,
        ProtoPort, Protocol, Provider, Subject, parsed_name,
    },
};
use log::{debug, info};

/// Records of both directions, incoming first. `service` must be given when the policy targets a
/// service.
pub fn parse(policy: &PolycubeNetworkPolicy, service: Option<&ServiceInfo>) -> Result<Vec<ParsedPolicy>> {
    let namespace = (policy.metadata.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or(Error::MissingNamespace)?;

    let (subject, ports) = subject(policy, &namespace, service)?;

    let base = ParsedPolicy {
        name: String::new(),
        parent: ParentPolicy {
            name: policy.metadata.name.clone().unwrap_or_default(),
            priority: policy.priority.unwrap_or(DEFAULT_PRIORITY),
            provider: Provider::Pcn,
        },
        priority: 0,
        creation_time: policy.metadata.creation_timestamp.as_ref().map(|t| t.0),
        direction: Direction::Incoming,
        subject,
        peer: None,
        templates: vec![],
        action: PolicyAction::Forward,
    };

    let mut records = parse_direction(
        &base,
        Direction::Incoming,
        &policy.spec.ingress_rules,
        &ports,
        &namespace,
    );
    records.extend(parse_direction(
        &base,
        Direction::Outgoing,
        &policy.spec.egress_rules,
        &ports,
        &namespace,
    ));

    debug!(
        "pcn policy {namespace}/{}: {} records",
        base.parent.name,
        records.len()
    );
    Ok(records)
}

/// The subject of the policy and the ports its rules default to.
fn subject(
    policy: &PolycubeNetworkPolicy,
    namespace: &str,
    service: Option<&ServiceInfo>,
) -> Result<(Subject, Vec<ProtoPort>)> {
    let target = &policy.apply_to;
    match target.target {
        TargetKind::Pod => {
            let query = match target.any {
                Some(true) => None,
                _ => ObjectQuery::build(None, target.with_labels.as_ref()),
            };
            let subject = Subject {
                query,
                is_service: false,
                namespace: namespace.to_string(),
            };
            Ok((subject, vec![]))
        }
        TargetKind::Service => {
            let name = target.with_name.clone().unwrap_or_default();
            let service = service.ok_or_else(|| Error::MissingService(name.clone()))?;
            if service.selector.is_empty() {
                return Err(Error::EmptyServiceSelector(name));
            }
            let subject = Subject {
                query: Some(ObjectQuery::Labels(service.selector.clone())),
                is_service: true,
                namespace: namespace.to_string(),
            };
            Ok((subject, service_ports(service)))
        }
        TargetKind::Unknown => Err(Error::UnsupportedTarget),
    }
}

/// Ports the service's pods actually listen on.
pub fn service_ports(service: &ServiceInfo) -> Vec<ProtoPort> {
    let mut out = Vec::with_capacity(service.ports.len());
    for port in &service.ports {
        let protocol = match Protocol::parse(&port.protocol) {
            Some(p @ (Protocol::Tcp | Protocol::Udp)) => p,
            _ => {
                info!(
                    "service {}/{}: protocol {} is not supported, port ignored",
                    service.namespace, service.name, port.protocol
                );
                continue;
            }
        };
        out.push(ProtoPort {
            protocol: Some(protocol),
            sport: None,
            dport: Some(port.target_port.unwrap_or(port.port)),
        });
    }
    out
}

fn parse_action(action: Option<&str>) -> Option<RuleAction> {
    let Some(action) = action else {
        return Some(RuleAction::Forward);
    };
    match action.to_ascii_lowercase().as_str() {
        "drop" | "block" | "forbid" | "prohibit" => Some(RuleAction::Drop),
        "forward" | "allow" | "pass" | "permit" => Some(RuleAction::Forward),
        _ => None,
    }
}

fn port_of(port: i32) -> Option<u16> {
    u16::try_from(port).ok().filter(|p| *p != 0)
}

fn parse_protocols(protocols: &[ProtocolContainer]) -> Vec<ProtoPort> {
    let mut out = Vec::with_capacity(protocols.len());
    for pc in protocols {
        let Some(protocol) = Protocol::parse(&pc.protocol) else {
            info!("protocol {:?} is not supported, ignored", pc.protocol);
            continue;
        };
        out.push(ProtoPort {
            protocol: Some(protocol),
            sport: port_of(pc.ports.source),
            dport: port_of(pc.ports.destination),
        });
    }
    out
}

/// Peers of a pod peer, one per namespace alternative.
fn pod_peers(peer: &crd::Peer, namespace: &str) -> Vec<Peer> {
    let pods = match peer.any {
        Some(true) => None,
        _ => ObjectQuery::build(peer.with_name.as_deref(), peer.with_labels.as_ref()),
    };

    let Some(ref on_ns) = peer.on_namespace else {
        return vec![Peer::Pods {
            pods,
            namespace: Some(ObjectQuery::Name(namespace.to_string())),
        }];
    };

    if on_ns.any == Some(true) {
        return vec![Peer::Pods {
            pods,
            namespace: None,
        }];
    }

    if !on_ns.with_names.is_empty() {
        return (on_ns.with_names.iter())
            .map(|ns| Peer::Pods {
                pods: pods.clone(),
                namespace: Some(ObjectQuery::Name(ns.clone())),
            })
            .collect();
    }

    vec![Peer::Pods {
        pods,
        namespace: ObjectQuery::build(None, on_ns.with_labels.as_ref()),
    }]
}

fn parse_direction(
    base: &ParsedPolicy,
    direction: Direction,
    container: &impl RuleContainer,
    service_ports: &[ProtoPort],
    namespace: &str,
) -> Vec<ParsedPolicy> {
    if !container.is_filled() {
        return vec![];
    }

    let parent = &base.parent;
    let base = ParsedPolicy {
        direction,
        ..base.clone()
    };

    if container.drop_all() {
        return vec![ParsedPolicy {
            name: parsed_name(parent, direction, 0, 0),
            templates: build_rule_templates(RuleAction::Drop, service_ports),
            action: PolicyAction::DropAll,
            ..base
        }];
    }
    if container.allow_all() {
        return vec![ParsedPolicy {
            name: parsed_name(parent, direction, 0, 0),
            templates: build_rule_templates(RuleAction::Forward, service_ports),
            action: PolicyAction::ForwardAll,
            ..base
        }];
    }

    let mut records = Vec::new();
    let mut peer_id = 0;

    for (rule_id, (peer, protocols, action)) in container.rules().into_iter().enumerate() {
        let rule_name = parsed_name(parent, direction, rule_id, peer_id);

        let ports = if protocols.is_empty() {
            service_ports.to_vec()
        } else {
            let ports = parse_protocols(protocols);
            if ports.is_empty() {
                info!("{rule_name}: no supported protocol, rule ignored");
                continue;
            }
            ports
        };

        let Some(rule_action) = parse_action(action) else {
            info!("{rule_name}: unknown action {action:?}, rule ignored");
            continue;
        };
        let policy_action = match rule_action {
            RuleAction::Forward => PolicyAction::Forward,
            RuleAction::Drop => PolicyAction::Drop,
        };

        let peers = match peer.peer {
            PeerKind::World => {
                let ips = peer.with_ip.as_ref().map(|w| w.list.clone()).unwrap_or_default();
                if ips.is_empty() {
                    info!("{rule_name}: world peer without ips, rule ignored");
                    continue;
                }
                vec![Peer::IpBlock(ips)]
            }
            PeerKind::Pod => pod_peers(peer, namespace),
            PeerKind::Unknown => {
                info!("{rule_name}: unknown peer kind, rule ignored");
                continue;
            }
        };

        let templates = build_rule_templates(rule_action, &ports);
        for peer in peers {
            records.push(ParsedPolicy {
                name: parsed_name(parent, direction, rule_id, peer_id),
                priority: peer_id as i32,
                peer: Some(peer),
                templates: templates.clone(),
                action: policy_action,
                ..base.clone()
            });
            peer_id += 1;
        }
    }

    if records.is_empty() {
        // every rule was skipped: the direction is still restricted
        info!(
            "{}: no usable rule, only the default action applies",
            parsed_name(parent, direction, 0, 0)
        );
        records.push(ParsedPolicy {
            name: parsed_name(parent, direction, 0, 0),
            action: PolicyAction::DropAll,
            ..base
        });
    }
    records
}
