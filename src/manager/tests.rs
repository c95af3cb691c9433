use super::*;
use crate::change::Kind;
use crate::cluster::{
    KubeCluster,
    tests::{cluster, namespace, pod, service},
};
use crate::sink::{Chain, RuleAction, memory::MemorySink};
use kube::runtime::watcher::Event;
use serde_json::{Value, json};

const NODE: &str = "node-1";

struct Env {
    sink: Arc<MemorySink>,
    cluster: KubeCluster,
    k8s: Store<NetworkPolicy>,
    mgr: NetworkPolicyManager<MemorySink, KubeCluster>,
}

async fn env(
    pods: Vec<core::Pod>,
    namespaces: Vec<core::Namespace>,
    services: Vec<core::Service>,
    k8s: Vec<NetworkPolicy>,
    pcn: Vec<PolycubeNetworkPolicy>,
) -> Env {
    let sink = Arc::new(MemorySink::new());
    let cluster = cluster(pods, namespaces, services).await;
    let k8s = Store::from_objects(k8s).await;
    let pcn = Store::from_objects(pcn).await;

    let mgr = NetworkPolicyManager::new(
        Config {
            node_name: NODE.into(),
            ignored_namespaces: Set::from(["kube-system".to_string()]),
        },
        Resolver::new(Arc::new(cluster.clone()), None),
        FirewallManager::new(sink.clone()),
        k8s.clone(),
        pcn,
    );

    Env {
        sink,
        cluster,
        k8s,
        mgr,
    }
}

fn added<K>(obj: K) -> Change<K> {
    Change {
        kind: Kind::Added,
        new: Some(Arc::new(obj)),
        old: None,
    }
}

fn updated<K>(old: K, new: K) -> Change<K> {
    Change {
        kind: Kind::Updated,
        new: Some(Arc::new(new)),
        old: Some(Arc::new(old)),
    }
}

fn deleted<K>(old: K) -> Change<K> {
    Change {
        kind: Kind::Deleted,
        new: None,
        old: Some(Arc::new(old)),
    }
}

fn key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> keys::Object {
    keys::Object::try_from(meta).unwrap()
}

fn selector(ns: &str, labels: Value) -> Selector {
    Selector {
        namespace: ns.into(),
        labels: serde_json::from_value(labels).unwrap(),
    }
}

fn network_policy(ns: &str, name: &str, spec: Value) -> NetworkPolicy {
    serde_json::from_value(json!({
        "metadata": {"namespace": ns, "name": name, "resourceVersion": "1"},
        "spec": spec,
    }))
    .unwrap()
}

fn pcn_policy(ns: &str, name: &str, apply_to: Value, spec: Value) -> PolycubeNetworkPolicy {
    serde_json::from_value(json!({
        "apiVersion": "polycube.network/v1beta",
        "kind": "PolycubeNetworkPolicy",
        "metadata": {"namespace": ns, "name": name, "resourceVersion": "1"},
        "applyTo": apply_to,
        "spec": spec,
    }))
    .unwrap()
}

impl Env {
    async fn pod_added(&self, p: core::Pod) {
        self.cluster.pods.ingest(Event::Apply(p.clone())).await;
        self.mgr.on_pod(&key(&p.metadata), added(p)).await.unwrap();
    }

    async fn pod_deleted(&self, p: core::Pod) {
        self.cluster.pods.ingest(Event::Delete(p.clone())).await;
        self.mgr.on_pod(&key(&p.metadata), deleted(p)).await.unwrap();
    }

    fn rules(&self, sel: &Selector, chain: Chain) -> Vec<ChainRule> {
        self.sink.rules(&sel.firewall_name(), chain)
    }

    fn sources(&self, sel: &Selector, chain: Chain) -> Vec<String> {
        (self.rules(sel, chain).into_iter())
            .filter_map(|r| r.src)
            .collect()
    }

    fn default_action(&self, sel: &Selector, chain: Chain) -> Option<RuleAction> {
        self.sink.default_action(&sel.firewall_name(), chain)
    }
}

fn from_team_b() -> NetworkPolicy {
    network_policy(
        "ns1",
        "from-team-b",
        json!({
            "podSelector": {},
            "ingress": [{"from": [{"namespaceSelector": {"matchLabels": {"team": "b"}}}]}],
        }),
    )
}

#[tokio::test]
async fn test_ingress_from_namespace() {
    let b = pod("ns2", "b", json!({}), "10.0.2.5");
    let env = env(
        vec![b],
        vec![namespace("ns1", json!({})), namespace("ns2", json!({"team": "b"}))],
        vec![],
        vec![from_team_b()],
        vec![],
    )
    .await;

    env.pod_added(pod("ns1", "a", json!({}), "10.0.1.6")).await;
    env.pod_added(pod("ns1", "c", json!({}), "10.0.1.7")).await;

    let sel = selector("ns1", json!({}));
    assert_eq!(env.mgr.firewalls().all().await.len(), 1);

    // incoming traffic is filtered by the egress chain
    assert_eq!(env.sources(&sel, Chain::Egress), ["10.0.2.5"]);
    let rules = env.rules(&sel, Chain::Egress);
    assert_eq!(rules[0].action, RuleAction::Forward);
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Drop));

    // no egress restriction
    assert!(env.rules(&sel, Chain::Ingress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Ingress), Some(RuleAction::Forward));
}

#[tokio::test]
async fn test_peer_pods_come_and_go() {
    let b = pod("ns2", "b", json!({}), "10.0.2.5");
    let env = env(
        vec![b.clone()],
        vec![namespace("ns1", json!({})), namespace("ns2", json!({"team": "b"}))],
        vec![],
        vec![from_team_b()],
        vec![],
    )
    .await;
    let sel = selector("ns1", json!({}));

    env.pod_added(pod("ns1", "a", json!({}), "10.0.1.6")).await;

    env.pod_added(pod("ns2", "b2", json!({}), "10.0.2.9")).await;
    assert_eq!(env.sources(&sel, Chain::Egress), ["10.0.2.5", "10.0.2.9"]);

    let appended = env.sink.appended(&sel.firewall_name(), Chain::Egress);
    env.pod_deleted(b).await;
    let after = env.rules(&sel, Chain::Egress);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].src.as_deref(), Some("10.0.2.9"));
    // the remaining rule was not re-injected
    assert_eq!(env.sink.appended(&sel.firewall_name(), Chain::Egress), appended);

    // pods outside the peer namespaces change nothing
    env.pod_added(pod("ns1", "d", json!({"x": "y"}), "10.0.1.8")).await;
    assert_eq!(env.rules(&sel, Chain::Egress), after);
}

#[tokio::test]
async fn test_namespace_relabel() {
    let env = env(
        vec![pod("ns3", "c", json!({}), "10.0.3.4")],
        vec![namespace("ns1", json!({})), namespace("ns3", json!({}))],
        vec![],
        vec![from_team_b()],
        vec![],
    )
    .await;
    let sel = selector("ns1", json!({}));

    env.pod_added(pod("ns1", "a", json!({}), "10.0.1.6")).await;
    assert!(env.sources(&sel, Chain::Egress).is_empty());

    let old = namespace("ns3", json!({}));
    let mut new = namespace("ns3", json!({"team": "b"}));
    new.metadata.resource_version = Some("2".into());
    env.cluster.namespaces.ingest(Event::Apply(new.clone())).await;
    env.mgr.on_namespace(updated(old, new)).await.unwrap();

    assert_eq!(env.sources(&sel, Chain::Egress), ["10.0.3.4"]);
}

#[tokio::test]
async fn test_policy_lifecycle() {
    let env = env(
        vec![pod("ns2", "b", json!({}), "10.0.2.5")],
        vec![namespace("ns1", json!({})), namespace("ns2", json!({"team": "b"}))],
        vec![],
        vec![],
        vec![],
    )
    .await;
    let sel = selector("ns1", json!({"app": "api"}));
    env.pod_added(pod("ns1", "a", json!({"app": "api"}), "10.0.1.6")).await;
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));

    // added after the pod
    let policy = network_policy(
        "ns1",
        "api",
        json!({
            "podSelector": {"matchLabels": {"app": "api"}},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{"from": [{"namespaceSelector": {"matchLabels": {"team": "b"}}}]}],
        }),
    );
    let policy_key = key(&policy.metadata);
    env.k8s.ingest(Event::Apply(policy.clone())).await;
    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, added(policy.clone()))
        .await
        .unwrap();

    assert_eq!(env.sources(&sel, Chain::Egress), ["10.0.2.5"]);
    // egress without rules: isolated
    assert!(env.rules(&sel, Chain::Ingress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Ingress), Some(RuleAction::Drop));

    // no longer selecting the group
    let mut moved = policy.clone();
    moved.spec.as_mut().unwrap().pod_selector.match_labels =
        Some([("app".to_string(), "web".to_string())].into());
    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, updated(policy.clone(), moved.clone()))
        .await
        .unwrap();
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));
    assert_eq!(env.default_action(&sel, Chain::Ingress), Some(RuleAction::Forward));

    // selecting again, then deleted
    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, updated(moved, policy.clone()))
        .await
        .unwrap();
    assert_eq!(env.sources(&sel, Chain::Egress), ["10.0.2.5"]);

    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, deleted(policy))
        .await
        .unwrap();
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));
}

#[tokio::test]
async fn test_unusable_rules_still_isolate() {
    let sctp_only = network_policy(
        "ns1",
        "sctp",
        json!({
            "podSelector": {},
            "ingress": [{"ports": [{"protocol": "SCTP", "port": 80}], "from": [{"podSelector": {}}]}],
        }),
    );
    let env = env(
        vec![pod("ns1", "c", json!({}), "10.0.1.7")],
        vec![namespace("ns1", json!({}))],
        vec![],
        vec![sctp_only.clone()],
        vec![],
    )
    .await;
    let sel = selector("ns1", json!({}));

    env.pod_added(pod("ns1", "a", json!({}), "10.0.1.6")).await;
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Drop));
    assert_eq!(env.default_action(&sel, Chain::Ingress), Some(RuleAction::Forward));

    // a usable version, then back to SCTP: the old rules go, isolation stays
    let policy_key = key(&sctp_only.metadata);
    let mut tcp = sctp_only.clone();
    tcp.metadata.resource_version = Some("2".into());
    let ingress = tcp.spec.as_mut().unwrap().ingress.as_mut().unwrap();
    ingress[0].ports.as_mut().unwrap()[0].protocol = Some("TCP".into());

    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, updated(sctp_only.clone(), tcp.clone()))
        .await
        .unwrap();
    let mut sources = env.sources(&sel, Chain::Egress);
    sources.sort();
    assert_eq!(sources, ["10.0.1.6", "10.0.1.7"]);

    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, updated(tcp, sctp_only.clone()))
        .await
        .unwrap();
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Drop));

    Handler::<NetworkPolicy>::handle(&env.mgr, &policy_key, deleted(sctp_only))
        .await
        .unwrap();
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));
}

#[tokio::test]
async fn test_service_ip_in_outgoing_rules() {
    let svc = service(
        "ns1",
        "api",
        json!({"app": "api"}),
        "10.96.0.10",
        json!([{"port": 80, "targetPort": 8080, "protocol": "TCP"}]),
    );
    let policy = pcn_policy(
        "ns1",
        "web-to-api",
        json!({"target": "pod", "withLabels": {"app": "web"}}),
        json!({"egressRules": {"rules": [{
            "to": {"peer": "pod", "withLabels": {"app": "api"}},
            "protocols": [{"protocol": "tcp", "ports": {"destination": 8080}}],
        }]}}),
    );
    let env = env(
        vec![pod("ns1", "api", json!({"app": "api"}), "10.0.1.7")],
        vec![namespace("ns1", json!({}))],
        vec![],
        vec![],
        vec![policy],
    )
    .await;
    let sel = selector("ns1", json!({"app": "web"}));

    env.pod_added(pod("ns1", "web", json!({"app": "web"}), "10.0.1.10")).await;

    // outgoing traffic is filtered by the ingress chain
    let rules = env.rules(&sel, Chain::Ingress);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].dst.as_deref(), Some("10.0.1.7"));
    assert_eq!(rules[0].dport, Some(8080));

    // the service shows up later
    env.cluster.services.ingest(Event::Apply(svc.clone())).await;
    env.mgr.on_service(&key(&svc.metadata), added(svc)).await.unwrap();

    let rules = env.rules(&sel, Chain::Ingress);
    assert_eq!(rules.len(), 2);
    assert!(
        rules.iter().any(|r| r.dst.as_deref() == Some("10.96.0.10") && r.dport == Some(80)),
        "{rules:?}"
    );
    assert_eq!(env.default_action(&sel, Chain::Ingress), Some(RuleAction::Drop));
}

#[tokio::test]
async fn test_service_target_waits_for_service() {
    let policy = pcn_policy(
        "ns1",
        "lock-api",
        json!({"target": "service", "withName": "api"}),
        json!({"ingressRules": {"dropAll": true}}),
    );
    let env = env(vec![], vec![namespace("ns1", json!({}))], vec![], vec![], vec![policy]).await;
    let sel = selector("ns1", json!({"app": "api"}));

    env.pod_added(pod("ns1", "api", json!({"app": "api"}), "10.0.1.7")).await;
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));

    let svc = service(
        "ns1",
        "api",
        json!({"app": "api"}),
        "10.96.0.10",
        json!([{"port": 80, "targetPort": 8080, "protocol": "TCP"}]),
    );
    env.cluster.services.ingest(Event::Apply(svc.clone())).await;
    env.mgr.on_service(&key(&svc.metadata), added(svc.clone())).await.unwrap();

    let rules = env.rules(&sel, Chain::Egress);
    assert!(!rules.is_empty());
    assert!(rules.iter().all(|r| r.action == RuleAction::Drop && r.dport == Some(8080)));
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Drop));

    // service gone: the policy can't be enforced anymore
    env.cluster.services.ingest(Event::Delete(svc.clone())).await;
    env.mgr.on_service(&key(&svc.metadata), deleted(svc)).await.unwrap();
    assert!(env.rules(&sel, Chain::Egress).is_empty());
    assert_eq!(env.default_action(&sel, Chain::Egress), Some(RuleAction::Forward));
}

#[tokio::test]
async fn test_node_scoping() {
    let env = env(vec![], vec![namespace("ns1", json!({}))], vec![], vec![], vec![]).await;

    let mut remote = pod("ns1", "remote", json!({}), "10.0.9.1");
    remote.spec.as_mut().unwrap().node_name = Some("node-2".into());
    env.pod_added(remote).await;

    let mut host = pod("ns1", "host", json!({}), "10.0.0.2");
    host.spec.as_mut().unwrap().host_network = Some(true);
    env.pod_added(host).await;

    env.pod_added(pod("kube-system", "dns", json!({}), "10.0.0.3")).await;

    assert!(env.mgr.firewalls().all().await.is_empty());
    assert!(env.sink.firewall_names().is_empty());
}

#[tokio::test]
async fn test_idle_firewall_destroyed() {
    let env = env(vec![], vec![namespace("ns1", json!({}))], vec![], vec![], vec![]).await;
    let a = pod("ns1", "a", json!({}), "10.0.1.6");
    let sel = selector("ns1", json!({}));

    env.pod_added(a.clone()).await;
    assert!(env.sink.exists(&sel.firewall_name()));
    assert!(env.mgr.sweep_idle(Duration::ZERO).await.is_empty());

    env.pod_deleted(a).await;
    assert_eq!(env.mgr.sweep_idle(Duration::ZERO).await, [sel.firewall_name()]);
    assert!(!env.sink.exists(&sel.firewall_name()));
}
