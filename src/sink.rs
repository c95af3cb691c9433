//! Rule sink: the local packet-filter service holding one firewall per monitored group.
//!
//! The service only knows firewalls, chains and rules by name and numeric id; what a rule
//! belongs to is tracked on our side (see [`crate::firewall`]).

#[cfg(test)]
pub mod memory;
pub mod polycube;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ingress,
    Egress,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Ingress, Chain::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ingress => "ingress",
            Chain::Egress => "egress",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Drop,
    Forward,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Drop => "drop",
            RuleAction::Forward => "forward",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conntrack {
    New,
    Established,
    Related,
    Invalid,
}

/// A single packet-filter rule, as understood by the backend.
///
/// `id` is assigned on our side right before injection (the backend evaluates a chain in id
/// order) and is the only handle to remove the rule later.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainRule {
    #[serde(default)]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conntrack: Option<Conntrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Description of the entry a chain listing ends with, standing for the chain default action.
pub const DEFAULT_POLICY: &str = "Default Policy";

impl ChainRule {
    /// true for the default action entry that ends every chain listing. It is not a rule: it
    /// can't be deleted and its id is the one the next appended rule gets.
    pub fn is_default_policy(&self) -> bool {
        self.description.as_deref() == Some(DEFAULT_POLICY)
    }

    /// true if both rules match the same packets with the same verdict, whatever their ids.
    pub fn same_match(&self, other: &ChainRule) -> bool {
        self.src == other.src
            && self.dst == other.dst
            && self.l4proto == other.l4proto
            && self.sport == other.sport
            && self.dport == other.dport
            && self.action == other.action
            && self.conntrack == other.conntrack
    }
}

impl fmt::Display for ChainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.action)?;
        if let Some(ref proto) = self.l4proto {
            write!(f, " {proto}")?;
        }
        if let Some(ref src) = self.src {
            write!(f, " src={src}")?;
        }
        if let Some(sport) = self.sport {
            write!(f, " sport={sport}")?;
        }
        if let Some(ref dst) = self.dst {
            write!(f, " dst={dst}")?;
        }
        if let Some(dport) = self.dport {
            write!(f, " dport={dport}")?;
        }
        Ok(())
    }
}

/// The id the next appended rule must get, given the listing of a chain. Ids are dense: the
/// backend refuses gaps and renumbers the rules following a deleted one.
pub fn next_rule_id(rules: &[ChainRule]) -> u32 {
    (rules.iter())
        .filter(|r| !r.is_default_policy())
        .map(|r| r.id + 1)
        .max()
        .unwrap_or(0)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{method} {path}: status {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },
    #[error("{path}: invalid response: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("firewall {0} does not exist")]
    NoFirewall(String),
}

/// CRUD operations on named firewalls, chains and rules.
pub trait RuleSink: Send + Sync + 'static {
    fn create_firewall(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn delete_firewall(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn firewall_exists(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// rules currently in the chain, in evaluation order, then the default action entry (see
    /// [`ChainRule::is_default_policy`]).
    fn read_chain(
        &self,
        name: &str,
        chain: Chain,
    ) -> impl Future<Output = Result<Vec<ChainRule>>> + Send;

    fn append_rules(
        &self,
        name: &str,
        chain: Chain,
        rules: &[ChainRule],
    ) -> impl Future<Output = Result<()>> + Send;

    /// deletes a rule; the following rules of the chain move down one id.
    fn delete_rule(&self, name: &str, chain: Chain, id: u32)
    -> impl Future<Output = Result<()>> + Send;

    fn set_default_action(
        &self,
        name: &str,
        chain: Chain,
        action: RuleAction,
    ) -> impl Future<Output = Result<()>> + Send;

    /// commit pending changes of a chain to the data plane.
    fn apply_rules(&self, name: &str, chain: Chain) -> impl Future<Output = Result<()>> + Send;
}
