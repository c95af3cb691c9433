//! One firewall per group of pods sharing a namespace and a label set.

use super::{DeployedFirewall, Result};
use crate::{keys, sink::RuleSink};
use log::{info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Identity of a pod group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector {
    pub namespace: String,
    pub labels: Map<String, String>,
}

impl Selector {
    pub fn firewall_name(&self) -> String {
        let mut id = self.namespace.clone();
        for (k, v) in &self.labels {
            id.push_str(&format!("|{k}={v}"));
        }
        format!("fw-{:016x}", xxhash_rust::xxh3::xxh3_64(id.as_bytes()))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.namespace)?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

struct Group<S> {
    firewall: Arc<DeployedFirewall<S>>,
    pods: Set<keys::Object>,
    idle_since: Option<Instant>,
    synced: bool,
}

pub struct FirewallManager<S> {
    sink: Arc<S>,
    groups: Mutex<Map<Selector, Group<S>>>,
}

/// What [`FirewallManager::add_pod`] did.
pub struct Membership<S> {
    pub firewall: Arc<DeployedFirewall<S>>,
    pub created: bool,
    /// the policies of the group were never successfully applied to the firewall
    pub needs_sync: bool,
}

impl<S: RuleSink> FirewallManager<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self {
            sink,
            groups: Mutex::new(Map::new()),
        }
    }

    /// Puts a pod in its group, creating the group's firewall if needed. The pod leaves any other
    /// group.
    pub async fn add_pod(&self, selector: &Selector, pod: &keys::Object) -> Result<Membership<S>> {
        let mut groups = self.groups.lock().await;
        release(&mut groups, pod, Some(selector));

        if let Some(group) = groups.get_mut(selector) {
            group.pods.insert(pod.clone());
            group.idle_since = None;
            return Ok(Membership {
                firewall: group.firewall.clone(),
                created: false,
                needs_sync: !group.synced,
            });
        }

        let name = selector.firewall_name();
        let firewall = Arc::new(DeployedFirewall::create(name, self.sink.clone()).await?);
        info!("{selector}: firewall {} created for {pod}", firewall.name());

        groups.insert(
            selector.clone(),
            Group {
                firewall: firewall.clone(),
                pods: Set::from([pod.clone()]),
                idle_since: None,
                synced: false,
            },
        );
        Ok(Membership {
            firewall,
            created: true,
            needs_sync: true,
        })
    }

    pub async fn mark_synced(&self, selector: &Selector) {
        if let Some(group) = self.groups.lock().await.get_mut(selector) {
            group.synced = true;
        }
    }

    /// Removes a pod from its group. The firewall is kept until it's idle long enough.
    pub async fn remove_pod(&self, pod: &keys::Object) {
        let mut groups = self.groups.lock().await;
        release(&mut groups, pod, None);
    }

    pub async fn get(&self, selector: &Selector) -> Option<Arc<DeployedFirewall<S>>> {
        let groups = self.groups.lock().await;
        groups.get(selector).map(|g| g.firewall.clone())
    }

    /// Every firewall with its group.
    pub async fn all(&self) -> Vec<(Selector, Arc<DeployedFirewall<S>>)> {
        let groups = self.groups.lock().await;
        (groups.iter())
            .map(|(sel, g)| (sel.clone(), g.firewall.clone()))
            .collect()
    }

    /// Destroys firewalls whose group has been empty for at least `idle_timeout`.
    pub async fn destroy_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let mut groups = self.groups.lock().await;
        let now = Instant::now();

        let expired: Vec<_> = (groups.iter())
            .filter(|(_, g)| g.idle_since.is_some_and(|t| now.duration_since(t) >= idle_timeout))
            .map(|(sel, _)| sel.clone())
            .collect();

        let mut destroyed = Vec::new();
        for selector in expired {
            let Some(group) = groups.get(&selector) else {
                continue;
            };
            match group.firewall.destroy().await {
                Ok(()) => {
                    destroyed.push(group.firewall.name().to_string());
                    groups.remove(&selector);
                }
                Err(e) => warn!("{selector}: idle firewall not destroyed: {e}"),
            }
        }
        destroyed
    }
}

fn release<S>(groups: &mut Map<Selector, Group<S>>, pod: &keys::Object, keep: Option<&Selector>) {
    for (selector, group) in groups.iter_mut() {
        if Some(selector) == keep || !group.pods.remove(pod) {
            continue;
        }
        if group.pods.is_empty() {
            info!("{selector}: no more pods, firewall is idle");
            group.idle_since = Some(Instant::now());
        }
    }
}
