//! Where a parsed policy goes in a chain, and what a chain does with unmatched traffic.

use crate::{
    sink::{Chain, RuleAction},
    types::{Direction, ParsedPolicy},
};
use chrono::{DateTime, Utc};

/// Global evaluation order of parsed policies: parent priority, parent creation time, then the
/// priority within the parent. The parent name only makes the order total.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub parent_priority: i32,
    pub creation_time: Option<DateTime<Utc>>,
    pub parent: String,
    pub priority: i32,
}

impl From<&ParsedPolicy> for OrderKey {
    fn from(p: &ParsedPolicy) -> Self {
        Self {
            parent_priority: p.parent.priority,
            creation_time: p.creation_time,
            parent: format!("{}:{}", p.parent.provider, p.parent.name),
            priority: p.priority,
        }
    }
}

/// Number of already applied policies (ordered by key) that must precede `key`. Equal keys go
/// first.
pub fn calculate_policy_offset(key: &OrderKey, applied: &[OrderKey]) -> usize {
    applied.partition_point(|k| k <= key)
}

/// Catch-all action of a direction given the directions of the policies applied to the subject.
pub fn calculate_default_action(
    direction: Direction,
    applied: impl IntoIterator<Item = Direction>,
) -> RuleAction {
    if applied.into_iter().any(|d| d == direction) {
        RuleAction::Drop
    } else {
        RuleAction::Forward
    }
}

/// Backend chain filtering a policy direction: traffic coming to the subject leaves the firewall
/// toward the pod, so it crosses the egress chain, and the other way around.
pub fn dir_to_chain(direction: Direction) -> Chain {
    match direction {
        Direction::Incoming => Chain::Egress,
        Direction::Outgoing => Chain::Ingress,
    }
}
