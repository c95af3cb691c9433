//! Network policy manager: turns policy and cluster changes into firewall updates.
//!
//! Policy changes are parsed, resolved and applied to every firewall whose group the policy's
//! subject selects. Pod, namespace and service changes only re-resolve the parsed policies
//! already applied whose peers they may affect.

use crate::{
    change::Change,
    cluster::{Cluster, NamespaceInfo, PodInfo, ServiceInfo},
    controllers::Handler,
    crd::{PolycubeNetworkPolicy, TargetKind},
    firewall::{
        DeployedFirewall,
        manager::{FirewallManager, Selector},
    },
    keys,
    parsers::{self, Policy},
    resolver::{self, Resolver},
    sink::{ChainRule, RuleSink},
    store::Store,
    types::{Direction, ObjectQuery, ParsedPolicy, Peer, Provider, query_matches},
};
use eyre::format_err;
use k8s_openapi::api::{core::v1 as core, networking::v1::NetworkPolicy};
use log::{debug, error, info};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Arc;
use std::time::Duration;

pub struct Config {
    pub node_name: String,
    pub ignored_namespaces: Set<String>,
}

pub struct NetworkPolicyManager<S, C> {
    config: Config,
    resolver: Resolver<C>,
    firewalls: FirewallManager<S>,
    k8s_policies: Store<NetworkPolicy>,
    pcn_policies: Store<PolycubeNetworkPolicy>,
}

type Resolved = (Arc<ParsedPolicy>, resolver::Result<Vec<ChainRule>>);

fn failures(what: &str, count: usize) -> eyre::Result<()> {
    if count == 0 {
        Ok(())
    } else {
        Err(format_err!("{what}: {count} operations failed"))
    }
}

/// true if `peer` may select `pod`, living in namespace `ns`.
fn selects_pod(peer: &Peer, pod: &PodInfo, ns: &NamespaceInfo) -> bool {
    let Peer::Pods { pods, namespace } = peer else {
        return false;
    };
    query_matches(pods.as_ref(), &pod.name, &pod.labels)
        && query_matches(namespace.as_ref(), &ns.name, &ns.labels)
}

/// What of a pod matters to peer resolution.
fn peer_view(pod: Option<PodInfo>) -> Option<PodInfo> {
    pod.filter(PodInfo::is_live).map(|pod| PodInfo {
        node: None,
        ..pod
    })
}

impl<S: RuleSink, C: Cluster> NetworkPolicyManager<S, C> {
    pub fn new(
        config: Config,
        resolver: Resolver<C>,
        firewalls: FirewallManager<S>,
        k8s_policies: Store<NetworkPolicy>,
        pcn_policies: Store<PolycubeNetworkPolicy>,
    ) -> Self {
        Self {
            config,
            resolver,
            firewalls,
            k8s_policies,
            pcn_policies,
        }
    }

    pub fn firewalls(&self) -> &FirewallManager<S> {
        &self.firewalls
    }

    /// true if the pod gets a firewall on this node.
    fn is_monitored(&self, pod: &PodInfo) -> bool {
        pod.is_live()
            && !pod.host_network
            && pod.node.as_deref() == Some(self.config.node_name.as_str())
            && !self.config.ignored_namespaces.contains(&pod.namespace)
    }

    /// Parsed records of a policy. `None` when the policy can't be enforced as it is (the
    /// reason is logged).
    async fn parse(&self, policy: &Policy) -> eyre::Result<Option<Vec<Arc<ParsedPolicy>>>> {
        let service = match policy.service_target() {
            Ok(None) => None,
            Ok(Some(name)) => {
                let namespace = policy.namespace().unwrap_or_default();
                self.resolver.cluster().service(namespace, name).await?
            }
            Err(e) => {
                error!("{policy}: failed to parse: {e}");
                return Ok(None);
            }
        };

        match policy.parse(service.as_ref()) {
            Ok(parsed) => Ok(Some(parsed.into_iter().map(Arc::new).collect())),
            Err(e @ (parsers::Error::MissingService(_) | parsers::Error::EmptyServiceSelector(_))) => {
                info!("{policy}: ignored until its service is usable: {e}");
                Ok(None)
            }
            Err(e) => {
                error!("{policy}: failed to parse: {e}");
                Ok(None)
            }
        }
    }

    async fn resolve(&self, parsed: &[Arc<ParsedPolicy>]) -> Vec<Resolved> {
        let results = self.resolver.resolve_all(parsed).await;
        parsed.iter().cloned().zip(results).collect()
    }

    /// Applies resolved records to a firewall, returning the number of failures.
    async fn apply_resolved(&self, fw: &DeployedFirewall<S>, resolved: &[&Resolved]) -> usize {
        let mut failed = 0;
        for (parsed, rules) in resolved {
            let rules = match rules {
                Ok(rules) => rules.clone(),
                Err(e) => {
                    error!("{}: failed to resolve peers: {e}", parsed.name);
                    failed += 1;
                    continue;
                }
            };
            if let Err(e) = fw.apply(parsed.clone(), rules).await {
                error!("{}: {}: failed to apply: {e}", fw.name(), parsed.name);
                failed += 1;
            }
        }
        failed
    }

    /// Parses a policy and puts it on every firewall it selects, removing it from the others.
    pub async fn deploy_policy(&self, policy: &Policy) -> eyre::Result<()> {
        let Some(key) = policy.key() else {
            return Ok(());
        };
        let provider = policy.provider();

        let Some(parsed) = self.parse(policy).await? else {
            return self.remove_policy(provider, &key).await;
        };
        let subject = parsed.first().map(|p| p.subject.clone());

        let mut resolved: Option<Vec<Resolved>> = None;
        let mut failed = 0;

        for (selector, fw) in self.firewalls.all().await {
            if selector.namespace != key.namespace {
                continue;
            }

            let selected = (subject.as_ref())
                .is_some_and(|s| s.matches(&selector.namespace, &selector.labels));

            if !selected {
                if fw.implements_parent(provider, &key.name).await
                    && let Err(e) = fw.cease_parent(provider, &key.name).await
                {
                    error!("{}: {policy}: failed to cease: {e}", fw.name());
                    failed += 1;
                }
                continue;
            }

            if resolved.is_none() {
                resolved = Some(self.resolve(&parsed).await);
            }
            let records: Vec<&Resolved> = resolved.iter().flatten().collect();

            info!("{}: applying {policy} ({} records)", fw.name(), records.len());
            failed += self.apply_resolved(&fw, &records).await;

            // records of a previous version of the policy
            let names: Set<&str> = parsed.iter().map(|p| p.name.as_str()).collect();
            for applied in fw.applied_policies().await {
                if applied.parent.provider != provider
                    || applied.parent.name != key.name
                    || names.contains(applied.name.as_str())
                {
                    continue;
                }
                if let Err(e) = fw.cease_policy(&applied.name).await {
                    error!("{}: {}: failed to cease: {e}", fw.name(), applied.name);
                    failed += 1;
                }
            }
        }

        failures(&policy.to_string(), failed)
    }

    /// Removes a policy from every firewall.
    pub async fn remove_policy(&self, provider: Provider, key: &keys::Object) -> eyre::Result<()> {
        let mut failed = 0;
        for (selector, fw) in self.firewalls.all().await {
            if selector.namespace != key.namespace
                || !fw.implements_parent(provider, &key.name).await
            {
                continue;
            }
            info!("{}: removing {provider} policy {key}", fw.name());
            if let Err(e) = fw.cease_parent(provider, &key.name).await {
                error!("{}: {provider} policy {key}: failed to cease: {e}", fw.name());
                failed += 1;
            }
        }
        failures(&format!("{provider} policy {key}"), failed)
    }

    async fn policies_in(&self, namespace: &str) -> Vec<Policy> {
        let in_ns = |meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta| {
            meta.namespace.as_deref() == Some(namespace)
        };
        let k8s = (self.k8s_policies.list(|p| in_ns(&p.metadata)).await)
            .into_iter()
            .map(Policy::K8s);
        let pcn = (self.pcn_policies.list(|p| in_ns(&p.metadata)).await)
            .into_iter()
            .map(Policy::Pcn);
        k8s.chain(pcn).collect()
    }

    /// Applies every policy selecting the group to its firewall.
    async fn sync_firewall(&self, selector: &Selector, fw: &DeployedFirewall<S>) -> eyre::Result<()> {
        let mut failed = 0;
        for policy in self.policies_in(&selector.namespace).await {
            let Some(parsed) = self.parse(&policy).await? else {
                continue;
            };
            let parsed: Vec<_> = (parsed.into_iter())
                .filter(|p| p.subject.matches(&selector.namespace, &selector.labels))
                .collect();
            if parsed.is_empty() {
                continue;
            }

            let resolved = self.resolve(&parsed).await;
            failed += self.apply_resolved(fw, &resolved.iter().collect::<Vec<_>>()).await;
        }

        failures(&format!("{}: sync of {selector}", fw.name()), failed)
    }

    /// Re-resolves and re-applies the applied records for which `affected` holds.
    async fn refresh(&self, affected: impl Fn(&ParsedPolicy) -> bool) -> eyre::Result<()> {
        // the same record is applied to every firewall of the group namespace it selects
        let mut cache: Map<(String, String), Option<Vec<ChainRule>>> = Map::new();
        let mut failed = 0;

        for (_, fw) in self.firewalls.all().await {
            for parsed in fw.applied_policies().await {
                if !affected(&parsed) {
                    continue;
                }

                let cache_key = (parsed.subject.namespace.clone(), parsed.name.clone());
                if !cache.contains_key(&cache_key) {
                    let rules = (self.resolver.resolve(&parsed).await)
                        .inspect_err(|e| error!("{}: failed to resolve peers: {e}", parsed.name))
                        .ok();
                    cache.insert(cache_key.clone(), rules);
                }
                let Some(Some(rules)) = cache.get(&cache_key).cloned() else {
                    failed += 1;
                    continue;
                };

                debug!("{}: refreshing {}", fw.name(), parsed.name);
                if let Err(e) = fw.apply(parsed.clone(), rules).await {
                    error!("{}: {}: failed to apply: {e}", fw.name(), parsed.name);
                    failed += 1;
                }
            }
        }

        failures("peer refresh", failed)
    }

    async fn namespace_info(&self, name: &str) -> eyre::Result<NamespaceInfo> {
        let query = ObjectQuery::Name(name.to_string());
        let found = self.resolver.cluster().namespaces(Some(&query)).await?;
        Ok(found.into_iter().next().unwrap_or_else(|| NamespaceInfo {
            name: name.to_string(),
            ..Default::default()
        }))
    }

    pub async fn on_pod(&self, key: &keys::Object, change: Change<core::Pod>) -> eyre::Result<()> {
        let new = change.new.as_deref().map(PodInfo::from);
        let old = change.old.as_deref().map(PodInfo::from);

        // subject side
        match new {
            Some(ref pod) if self.is_monitored(pod) => {
                let selector = Selector {
                    namespace: pod.namespace.clone(),
                    labels: pod.labels.clone(),
                };
                let membership = self.firewalls.add_pod(&selector, key).await?;
                if membership.needs_sync {
                    self.sync_firewall(&selector, &membership.firewall).await?;
                    self.firewalls.mark_synced(&selector).await;
                }
            }
            _ => self.firewalls.remove_pod(key).await,
        }

        // peer side
        let (old, new) = (peer_view(old), peer_view(new));
        if old == new {
            return Ok(());
        }

        let mut pods = Vec::new();
        for pod in [old, new].into_iter().flatten() {
            let ns = self.namespace_info(&pod.namespace).await?;
            pods.push((pod, ns));
        }

        self.refresh(|parsed| {
            (parsed.peer.as_ref())
                .is_some_and(|peer| pods.iter().any(|(pod, ns)| selects_pod(peer, pod, ns)))
        })
        .await
    }

    pub async fn on_namespace(&self, change: Change<core::Namespace>) -> eyre::Result<()> {
        let old = change.old.as_deref().map(NamespaceInfo::from);
        let new = change.new.as_deref().map(NamespaceInfo::from);

        // pods coming and going are handled as pod changes; only label queries can change here
        if old.as_ref().map(|n| &n.labels) == new.as_ref().map(|n| &n.labels) {
            return Ok(());
        }
        let namespaces: Vec<_> = [old, new].into_iter().flatten().collect();

        self.refresh(|parsed| match parsed.peer.as_ref().and_then(Peer::namespace_query) {
            Some(q @ ObjectQuery::Labels(_)) => (namespaces.iter()).any(|ns| q.matches(&ns.name, &ns.labels)),
            _ => false,
        })
        .await
    }

    pub async fn on_service(&self, key: &keys::Object, change: Change<core::Service>) -> eyre::Result<()> {
        let old = change.old.as_deref().map(ServiceInfo::from);
        let new = change.new.as_deref().map(ServiceInfo::from);

        // policies applied to the service
        let targeting: Vec<_> = (self.pcn_policies)
            .list(|p| {
                p.metadata.namespace.as_deref() == Some(key.namespace.as_str())
                    && p.apply_to.target == TargetKind::Service
                    && p.apply_to.with_name.as_deref() == Some(key.name.as_str())
            })
            .await;

        let mut result = Ok(());
        for policy in targeting {
            if let Err(e) = self.deploy_policy(&Policy::Pcn(policy)).await {
                result = Err(e);
            }
        }

        // peer side: outgoing rules carry the cluster IPs of the services of their peers
        if old != new {
            let ns = self.namespace_info(&key.namespace).await?;
            let refreshed = self
                .refresh(|parsed| {
                    parsed.direction == Direction::Outgoing
                        && matches!(parsed.peer, Some(Peer::Pods { ref namespace, .. })
                            if query_matches(namespace.as_ref(), &ns.name, &ns.labels))
                })
                .await;
            result = result.and(refreshed);
        }

        result
    }

    /// Destroys the firewalls of groups without pods for `idle_timeout`.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let destroyed = self.firewalls.destroy_idle(idle_timeout).await;
        for name in &destroyed {
            info!("{name}: idle firewall destroyed");
        }
        destroyed
    }

    /// Sweeps idle firewalls forever.
    pub async fn janitor(self: Arc<Self>, interval: Duration, idle_timeout: Duration) -> eyre::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep_idle(idle_timeout).await;
        }
    }
}

impl<S: RuleSink, C: Cluster> Handler<NetworkPolicy> for NetworkPolicyManager<S, C> {
    async fn handle(&self, key: &keys::Object, change: Change<NetworkPolicy>) -> eyre::Result<()> {
        match change.new {
            Some(policy) => self.deploy_policy(&Policy::K8s(policy)).await,
            None => self.remove_policy(Provider::K8s, key).await,
        }
    }
}

impl<S: RuleSink, C: Cluster> Handler<PolycubeNetworkPolicy> for NetworkPolicyManager<S, C> {
    async fn handle(&self, key: &keys::Object, change: Change<PolycubeNetworkPolicy>) -> eyre::Result<()> {
        match change.new {
            Some(policy) => self.deploy_policy(&Policy::Pcn(policy)).await,
            None => self.remove_policy(Provider::Pcn, key).await,
        }
    }
}

impl<S: RuleSink, C: Cluster> Handler<core::Pod> for NetworkPolicyManager<S, C> {
    async fn handle(&self, key: &keys::Object, change: Change<core::Pod>) -> eyre::Result<()> {
        self.on_pod(key, change).await
    }
}

impl<S: RuleSink, C: Cluster> Handler<core::Namespace> for NetworkPolicyManager<S, C> {
    async fn handle(&self, _key: &keys::Object, change: Change<core::Namespace>) -> eyre::Result<()> {
        self.on_namespace(change).await
    }
}

impl<S: RuleSink, C: Cluster> Handler<core::Service> for NetworkPolicyManager<S, C> {
    async fn handle(&self, key: &keys::Object, change: Change<core::Service>) -> eyre::Result<()> {
        self.on_service(key, change).await
    }
}

#[cfg(test)]
mod tests;
