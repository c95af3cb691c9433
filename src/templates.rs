//! Rule skeletons: protocol, ports and action, without any address.

use crate::sink::{ChainRule, Conntrack, RuleAction};
use crate::types::ProtoPort;

/// One skeleton per (protocol, port) pair, or a single wildcard skeleton when `ports` is empty.
pub fn build_rule_templates(action: RuleAction, ports: &[ProtoPort]) -> Vec<ChainRule> {
    let rule = ChainRule {
        action,
        conntrack: Some(Conntrack::New),
        ..Default::default()
    };
    insert_ports(&[rule], ports)
}

/// Expands every rule once per port entry.
pub fn insert_ports(rules: &[ChainRule], ports: &[ProtoPort]) -> Vec<ChainRule> {
    if ports.is_empty() {
        return rules.to_vec();
    }

    let mut out = Vec::with_capacity(rules.len() * ports.len());
    for rule in rules {
        for port in ports {
            out.push(ChainRule {
                l4proto: port.protocol.map(|p| p.as_str().to_string()),
                sport: port.sport,
                dport: port.dport,
                ..rule.clone()
            });
        }
    }
    out
}

/// Fresh copies of `templates` with the given addresses set.
pub fn fill_templates(src: Option<&str>, dst: Option<&str>, templates: &[ChainRule]) -> Vec<ChainRule> {
    (templates.iter())
        .map(|t| ChainRule {
            src: src.map(str::to_string).or_else(|| t.src.clone()),
            dst: dst.map(str::to_string).or_else(|| t.dst.clone()),
            ..t.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn test_wildcard_template() {
        let templates = build_rule_templates(RuleAction::Forward, &[]);
        assert_eq!(
            templates,
            vec![ChainRule {
                action: RuleAction::Forward,
                conntrack: Some(Conntrack::New),
                ..Default::default()
            }]
        );
    }

    #[test]
    fn test_port_expansion() {
        let ports = [
            ProtoPort {
                protocol: Some(Protocol::Tcp),
                sport: None,
                dport: Some(80),
            },
            ProtoPort {
                protocol: Some(Protocol::Udp),
                sport: None,
                dport: Some(53),
            },
            ProtoPort {
                protocol: None,
                sport: None,
                dport: Some(8080),
            },
        ];
        let templates = build_rule_templates(RuleAction::Drop, &ports);
        assert_eq!(templates.len(), 3);
        assert_eq!(templates[0].l4proto.as_deref(), Some("TCP"));
        assert_eq!(templates[0].dport, Some(80));
        assert_eq!(templates[1].l4proto.as_deref(), Some("UDP"));
        assert_eq!(templates[2].l4proto, None);
        assert_eq!(templates[2].dport, Some(8080));
        assert!(templates.iter().all(|t| t.action == RuleAction::Drop));
    }

    #[test]
    fn test_fill_does_not_alias() {
        let templates = build_rule_templates(RuleAction::Forward, &[]);

        let a = fill_templates(Some("10.0.0.1"), None, &templates);
        let b = fill_templates(Some("10.0.0.2"), None, &templates);

        assert_eq!(a[0].src.as_deref(), Some("10.0.0.1"));
        assert_eq!(b[0].src.as_deref(), Some("10.0.0.2"));
        assert_eq!(templates[0].src, None);

        let c = fill_templates(None, Some("10.1.0.0/16"), &templates);
        assert_eq!(c[0].src, None);
        assert_eq!(c[0].dst.as_deref(), Some("10.1.0.0/16"));
    }
}
