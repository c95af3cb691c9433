//! Intermediate representation shared by the parsers, the resolver and the injector.

use crate::sink::{ChainRule, RuleAction};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap as Map;
use std::fmt;

/// Priority of a policy that does not carry an explicit one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Traffic direction, as seen from the subject of a policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Incoming, Direction::Outgoing];

    /// suffix used in parsed policy names.
    pub fn suffix(&self) -> char {
        match self {
            Direction::Incoming => 'i',
            Direction::Outgoing => 'e',
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provider {
    K8s,
    Pcn,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::K8s => "k8s",
            Provider::Pcn => "pcn",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyAction {
    Forward,
    Drop,
    /// match every peer, templates are used as-is
    ForwardAll,
    DropAll,
}

impl PolicyAction {
    pub fn is_all(&self) -> bool {
        matches!(self, PolicyAction::ForwardAll | PolicyAction::DropAll)
    }

    pub fn rule_action(&self) -> RuleAction {
        match self {
            PolicyAction::Forward | PolicyAction::ForwardAll => RuleAction::Forward,
            PolicyAction::Drop | PolicyAction::DropAll => RuleAction::Drop,
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyAction::Forward => "forward",
            PolicyAction::Drop => "drop",
            PolicyAction::ForwardAll => "forward-all",
            PolicyAction::DropAll => "drop-all",
        })
    }
}

/// Query on pods or namespaces, by name or by labels.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectQuery {
    Name(String),
    Labels(Map<String, String>),
}

impl ObjectQuery {
    /// Builds a query from an optional name and label set. A name wins over labels, and nothing
    /// at all means "any object".
    pub fn build(name: Option<&str>, labels: Option<&Map<String, String>>) -> Option<Self> {
        if let Some(name) = name
            && !name.is_empty()
        {
            return Some(Self::Name(name.to_string()));
        }
        match labels {
            Some(labels) if !labels.is_empty() => Some(Self::Labels(labels.clone())),
            _ => None,
        }
    }

    pub fn matches(&self, name: &str, labels: &Map<String, String>) -> bool {
        match self {
            Self::Name(n) => n == name,
            Self::Labels(query) => labels_contained(query, labels),
        }
    }

    pub fn labels(&self) -> Option<&Map<String, String>> {
        match self {
            Self::Labels(labels) => Some(labels),
            Self::Name(_) => None,
        }
    }
}

/// `None` queries match everything.
pub fn query_matches(query: Option<&ObjectQuery>, name: &str, labels: &Map<String, String>) -> bool {
    query.is_none_or(|q| q.matches(name, labels))
}

/// true if every label of `needle` is in `haystack` with the same value.
pub fn labels_contained(needle: &Map<String, String>, haystack: &Map<String, String>) -> bool {
    needle.iter().all(|(k, v)| haystack.get(k) == Some(v))
}

impl fmt::Display for ObjectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name={name}"),
            Self::Labels(labels) => {
                f.write_str("labels=")?;
                for (i, (k, v)) in labels.iter().enumerate() {
                    if i != 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentPolicy {
    pub name: String,
    pub priority: i32,
    pub provider: Provider,
}

/// Who a policy applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    /// `None` selects every pod of the namespace
    pub query: Option<ObjectQuery>,
    pub is_service: bool,
    pub namespace: String,
}

impl Subject {
    pub fn matches(&self, namespace: &str, labels: &Map<String, String>) -> bool {
        if namespace != self.namespace {
            return false;
        }
        match self.query {
            None => true,
            Some(ObjectQuery::Labels(ref query)) => labels_contained(query, labels),
            // subjects are never queried by pod name
            Some(ObjectQuery::Name(_)) => false,
        }
    }
}

/// The other side of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    /// literal CIDRs
    IpBlock(Vec<String>),
    /// live pods matching `pods` in the namespaces matching `namespace`; `None` means any.
    Pods {
        pods: Option<ObjectQuery>,
        namespace: Option<ObjectQuery>,
    },
}

impl Peer {
    /// stable key of the peer description, identical peers get identical keys.
    pub fn key(&self) -> String {
        match self {
            Peer::IpBlock(ips) => format!("ip:{}", ips.join(",")),
            Peer::Pods { pods, namespace } => {
                let pods = pods.as_ref().map_or("*".to_string(), |q| q.to_string());
                let ns = namespace.as_ref().map_or("*".to_string(), |q| q.to_string());
                format!("pods:{pods}|ns:{ns}")
            }
        }
    }

    pub fn namespace_query(&self) -> Option<&ObjectQuery> {
        match self {
            Peer::Pods { namespace, .. } => namespace.as_ref(),
            Peer::IpBlock(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        }
    }

    /// Parses a protocol name, case-insensitive. `None` for anything unsupported.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            "ICMP" => Some(Protocol::Icmp),
            _ => None,
        }
    }
}

/// Protocol and ports of a rule, as seen from the subject (`dport` is the subject's port for
/// incoming traffic).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProtoPort {
    /// `None` matches every protocol
    pub protocol: Option<Protocol>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

/// Rules of a policy, per direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedRules {
    pub incoming: Vec<ChainRule>,
    pub outgoing: Vec<ChainRule>,
}

impl ParsedRules {
    pub fn get(&self, dir: Direction) -> &Vec<ChainRule> {
        match dir {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    pub fn get_mut(&mut self, dir: Direction) -> &mut Vec<ChainRule> {
        match dir {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }
}

/// One (policy, direction, peer) triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPolicy {
    pub name: String,
    pub parent: ParentPolicy,
    /// ordering among the records of the same parent, lower goes first
    pub priority: i32,
    pub creation_time: Option<DateTime<Utc>>,
    pub direction: Direction,
    pub subject: Subject,
    /// `None` for `*-all` actions
    pub peer: Option<Peer>,
    /// rule skeletons of `direction`, without addresses
    pub templates: Vec<ChainRule>,
    pub action: PolicyAction,
}

impl ParsedPolicy {
    pub fn peer_key(&self) -> Option<String> {
        self.peer.as_ref().map(Peer::key)
    }
}

/// Name of a parsed record: `<provider>:<policy>#<rule><i|e>p<peer>`.
pub fn parsed_name(parent: &ParentPolicy, direction: Direction, rule: usize, peer: usize) -> String {
    format!(
        "{}:{}#{rule}{}p{peer}",
        parent.provider,
        parent.name,
        direction.suffix()
    )
}
