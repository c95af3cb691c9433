//! Parser of standard `NetworkPolicy` objects.

use super::{Error, Result};
use crate::{
    resolver::{self, peer_from_ip_block, peer_from_selectors, query_from_selector},
    sink::RuleAction,
    templates::build_rule_templates,
    types::{
        DEFAULT_PRIORITY, Direction, ParentPolicy, ParsedPolicy, Peer, PolicyAction, ProtoPort,
        Protocol, Provider, Subject, parsed_name,
    },
};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::{error, info};

/// Records of both directions, incoming first.
pub fn parse(policy: &NetworkPolicy) -> Result<Vec<ParsedPolicy>> {
    let base = base_policy(policy)?;
    let name = &base.parent.name;
    let namespace = base.subject.namespace.clone();
    let spec = policy.spec.as_ref();

    let (ingress, egress) = policy_types(policy);

    let mut records = Vec::new();
    if ingress {
        let rules = spec.and_then(|s| s.ingress.as_ref());
        let rules = (rules.into_iter().flatten())
            .map(|r| (r.from.as_deref(), r.ports.as_deref()))
            .collect();
        records.extend(parse_direction(&base, Direction::Incoming, rules, &namespace));
    }
    if egress {
        let rules = spec.and_then(|s| s.egress.as_ref());
        let rules = (rules.into_iter().flatten())
            .map(|r| (r.to.as_deref(), r.ports.as_deref()))
            .collect();
        records.extend(parse_direction(&base, Direction::Outgoing, rules, &namespace));
    }

    log::debug!("k8s policy {namespace}/{name}: {} records", records.len());
    Ok(records)
}

/// (ingress, egress) activation; without policy types, only ingress is affected.
fn policy_types(policy: &NetworkPolicy) -> (bool, bool) {
    let types = (policy.spec.as_ref()).and_then(|s| s.policy_types.as_ref());
    match types {
        Some(types) if !types.is_empty() => (
            types.iter().any(|t| t == "Ingress"),
            types.iter().any(|t| t == "Egress"),
        ),
        _ => (true, false),
    }
}

fn base_policy(policy: &NetworkPolicy) -> Result<ParsedPolicy> {
    let namespace = (policy.metadata.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or(Error::MissingNamespace)?;

    let query = match policy.spec.as_ref().map(|s| &s.pod_selector) {
        Some(selector) => query_from_selector(selector).map_err(Error::UnsupportedSubject)?,
        None => None,
    };

    Ok(ParsedPolicy {
        name: String::new(),
        parent: ParentPolicy {
            name: policy.metadata.name.clone().unwrap_or_default(),
            priority: DEFAULT_PRIORITY,
            provider: Provider::K8s,
        },
        priority: 0,
        creation_time: policy.metadata.creation_timestamp.as_ref().map(|t| t.0),
        direction: Direction::Incoming,
        subject: Subject {
            query,
            is_service: false,
            namespace,
        },
        peer: None,
        templates: vec![],
        action: PolicyAction::Forward,
    })
}

fn parse_direction(
    base: &ParsedPolicy,
    direction: Direction,
    rules: Vec<(Option<&[NetworkPolicyPeer]>, Option<&[NetworkPolicyPort]>)>,
    namespace: &str,
) -> Vec<ParsedPolicy> {
    let parent = &base.parent;
    let base = ParsedPolicy {
        direction,
        ..base.clone()
    };

    if rules.is_empty() {
        // accept nothing: no rule, the default action does the job
        return vec![ParsedPolicy {
            name: parsed_name(parent, direction, 0, 0),
            action: PolicyAction::DropAll,
            ..base
        }];
    }

    let mut records = Vec::new();
    let mut peer_id = 0;

    for (rule_id, (peers, ports)) in rules.into_iter().enumerate() {
        let ports = ports.unwrap_or_default();
        let proto_ports = parse_ports(ports);
        if !ports.is_empty() && proto_ports.is_empty() {
            info!(
                "{}: rule {rule_id} has no supported port, ignored",
                parsed_name(parent, direction, rule_id, peer_id)
            );
            continue;
        }

        let forward = build_rule_templates(RuleAction::Forward, &proto_ports);

        let peers = peers.unwrap_or_default();
        if peers.is_empty() {
            records.push(ParsedPolicy {
                name: parsed_name(parent, direction, rule_id, peer_id),
                priority: peer_id as i32,
                templates: forward.clone(),
                action: PolicyAction::ForwardAll,
                ..base.clone()
            });
            peer_id += 1;
            continue;
        }

        for peer in peers {
            let parsed = match parse_peer(peer, namespace) {
                Ok(v) => v,
                Err(e) => {
                    error!(
                        "{}: peer failed to parse, skipped: {e}",
                        parsed_name(parent, direction, rule_id, peer_id)
                    );
                    continue;
                }
            };

            let (except, peer) = parsed;
            if let Some(except) = except {
                records.push(ParsedPolicy {
                    name: parsed_name(parent, direction, rule_id, peer_id),
                    priority: peer_id as i32,
                    peer: Some(except),
                    templates: build_rule_templates(RuleAction::Drop, &proto_ports),
                    action: PolicyAction::Drop,
                    ..base.clone()
                });
                peer_id += 1;
            }

            records.push(ParsedPolicy {
                name: parsed_name(parent, direction, rule_id, peer_id),
                priority: peer_id as i32,
                peer: Some(peer),
                templates: forward.clone(),
                action: PolicyAction::Forward,
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

fn parse_peer(peer: &NetworkPolicyPeer, namespace: &str) -> resolver::Result<(Option<Peer>, Peer)> {
    if let Some(ref block) = peer.ip_block {
        return peer_from_ip_block(block);
    }
    let peer = peer_from_selectors(
        peer.pod_selector.as_ref(),
        peer.namespace_selector.as_ref(),
        namespace,
    )?;
    Ok((None, peer))
}

/// Supported (protocol, port) pairs. Only TCP and UDP are kept; named ports and port ranges
/// can't be expressed as a single numeric port and are dropped too.
pub fn parse_ports(ports: &[NetworkPolicyPort]) -> Vec<ProtoPort> {
    let mut out = Vec::with_capacity(ports.len());
    for port in ports {
        let protocol = match port.protocol.as_deref() {
            None => None,
            Some(p) => match Protocol::parse(p) {
                Some(p @ (Protocol::Tcp | Protocol::Udp)) => Some(p),
                _ => {
                    info!("protocol {p} is not supported, port ignored");
                    continue;
                }
            },
        };

        if port.end_port.is_some() {
            info!("port ranges are not supported, port ignored");
            continue;
        }

        let dport = match port.port {
            None => None,
            Some(IntOrString::Int(p)) => match u16::try_from(p) {
                Ok(0) => None,
                Ok(p) => Some(p),
                Err(_) => {
                    info!("invalid port {p}, port ignored");
                    continue;
                }
            },
            Some(IntOrString::String(ref name)) => {
                info!("named port {name} is not supported, port ignored");
                continue;
            }
        };

        out.push(ProtoPort {
            protocol,
            sport: None,
            dport,
        });
    }
    out
}
