//! Read access to the cluster objects peers are resolved against.

use crate::{
    store::Store,
    types::{ObjectQuery, query_matches},
};
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap as Map;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: Map<String, String>,
    pub ip: Option<String>,
    pub node: Option<String>,
    pub running: bool,
    pub host_network: bool,
    pub terminating: bool,
}

impl PodInfo {
    /// running, addressable and not going away.
    pub fn is_live(&self) -> bool {
        self.running && self.ip.is_some() && !self.terminating
    }
}

impl From<&core::Pod> for PodInfo {
    fn from(pod: &core::Pod) -> Self {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            ip: status.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()),
            node: spec.and_then(|s| s.node_name.clone()),
            running: status.and_then(|s| s.phase.as_deref()) == Some("Running"),
            host_network: spec.and_then(|s| s.host_network).unwrap_or(false),
            terminating: meta.deletion_timestamp.is_some(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: Map<String, String>,
}

impl From<&core::Namespace> for NamespaceInfo {
    fn from(ns: &core::Namespace) -> Self {
        Self {
            name: ns.metadata.name.clone().unwrap_or_default(),
            labels: ns.metadata.labels.clone().unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    pub protocol: String,
    pub port: u16,
    /// numeric target port, `None` when named or unset
    pub target_port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub selector: Map<String, String>,
    /// `None` for headless services
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePort>,
}

impl From<&core::Service> for ServiceInfo {
    fn from(svc: &core::Service) -> Self {
        let spec = svc.spec.as_ref();
        let ports = (spec.and_then(|s| s.ports.as_ref()).into_iter().flatten())
            .filter_map(|p| {
                Some(ServicePort {
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".into()),
                    port: u16::try_from(p.port).ok()?,
                    target_port: match p.target_port {
                        Some(IntOrString::Int(port)) => u16::try_from(port).ok(),
                        _ => None,
                    },
                })
            })
            .collect();

        Self {
            name: svc.metadata.name.clone().unwrap_or_default(),
            namespace: svc.metadata.namespace.clone().unwrap_or_default(),
            selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
            cluster_ip: (spec.and_then(|s| s.cluster_ip.clone()))
                .filter(|ip| !ip.is_empty() && ip != "None"),
            ports,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} cache is not synced yet")]
    NotReady(&'static str),
}

/// Queries on pods, namespaces and services.
pub trait Cluster: Send + Sync + 'static {
    /// live pods of `namespace` matching `query` (`None`: all of them).
    fn pods(
        &self,
        query: Option<&ObjectQuery>,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<PodInfo>>> + Send;

    fn namespaces(
        &self,
        query: Option<&ObjectQuery>,
    ) -> impl Future<Output = Result<Vec<NamespaceInfo>>> + Send;

    fn services(&self, namespace: &str) -> impl Future<Output = Result<Vec<ServiceInfo>>> + Send;

    fn service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ServiceInfo>>> + Send;
}

/// [`Cluster`] backed by the watch caches.
#[derive(Clone, Default)]
pub struct KubeCluster {
    pub pods: Store<core::Pod>,
    pub namespaces: Store<core::Namespace>,
    pub services: Store<core::Service>,
}

impl KubeCluster {
    async fn check_ready<K: kube::Resource>(store: &Store<K>, what: &'static str) -> Result<()> {
        if store.is_ready().await {
            Ok(())
        } else {
            Err(Error::NotReady(what))
        }
    }
}

impl Cluster for KubeCluster {
    async fn pods(&self, query: Option<&ObjectQuery>, namespace: &str) -> Result<Vec<PodInfo>> {
        Self::check_ready(&self.pods, "pods").await?;

        let pods = (self.pods)
            .list(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .await;

        Ok((pods.iter())
            .map(|pod| PodInfo::from(pod.as_ref()))
            .filter(|pod| pod.is_live() && query_matches(query, &pod.name, &pod.labels))
            .collect())
    }

    async fn namespaces(&self, query: Option<&ObjectQuery>) -> Result<Vec<NamespaceInfo>> {
        Self::check_ready(&self.namespaces, "namespaces").await?;

        let nses = self.namespaces.list(|_| true).await;
        Ok((nses.iter())
            .map(|ns| NamespaceInfo::from(ns.as_ref()))
            .filter(|ns| query_matches(query, &ns.name, &ns.labels))
            .collect())
    }

    async fn services(&self, namespace: &str) -> Result<Vec<ServiceInfo>> {
        Self::check_ready(&self.services, "services").await?;

        let svcs = (self.services)
            .list(|svc| svc.metadata.namespace.as_deref() == Some(namespace))
            .await;
        Ok(svcs.iter().map(|svc| ServiceInfo::from(svc.as_ref())).collect())
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<ServiceInfo>> {
        Self::check_ready(&self.services, "services").await?;

        let key = crate::keys::Object::new(namespace, name);
        Ok(self.services.get(&key).await.map(|s| ServiceInfo::from(s.as_ref())))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::{Value, json};

    pub fn pod(namespace: &str, name: &str, labels: Value, ip: &str) -> core::Pod {
        serde_json::from_value(json!({
            "metadata": {
                "namespace": namespace,
                "name": name,
                "uid": format!("uid-{namespace}-{name}"),
                "resourceVersion": "1",
                "labels": labels,
            },
            "spec": {"nodeName": "node-1", "containers": []},
            "status": {"phase": "Running", "podIP": ip},
        }))
        .unwrap()
    }

    pub fn namespace(name: &str, labels: Value) -> core::Namespace {
        serde_json::from_value(json!({
            "metadata": {"name": name, "resourceVersion": "1", "labels": labels},
        }))
        .unwrap()
    }

    pub fn service(namespace: &str, name: &str, selector: Value, ip: &str, ports: Value) -> core::Service {
        serde_json::from_value(json!({
            "metadata": {"namespace": namespace, "name": name, "resourceVersion": "1"},
            "spec": {"selector": selector, "clusterIP": ip, "ports": ports},
        }))
        .unwrap()
    }

    pub async fn cluster(
        pods: Vec<core::Pod>,
        namespaces: Vec<core::Namespace>,
        services: Vec<core::Service>,
    ) -> KubeCluster {
        KubeCluster {
            pods: Store::from_objects(pods).await,
            namespaces: Store::from_objects(namespaces).await,
            services: Store::from_objects(services).await,
        }
    }

    fn labels(kv: &[(&str, &str)]) -> Map<String, String> {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_pod_queries() {
        let mut pending = pod("ns1", "pending", json!({"app": "db"}), "");
        pending.status.as_mut().unwrap().phase = Some("Pending".into());

        let cluster = cluster(
            vec![
                pod("ns1", "db-0", json!({"app": "db"}), "10.1.0.1"),
                pod("ns1", "web-0", json!({"app": "web"}), "10.1.0.2"),
                pod("ns2", "db-0", json!({"app": "db"}), "10.2.0.1"),
                pending,
            ],
            vec![],
            vec![],
        )
        .await;

        let all = cluster.pods(None, "ns1").await.unwrap();
        assert_eq!(all.len(), 2);

        let query = ObjectQuery::Labels(labels(&[("app", "db")]));
        let dbs = cluster.pods(Some(&query), "ns1").await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].ip.as_deref(), Some("10.1.0.1"));

        let query = ObjectQuery::Name("web-0".into());
        assert_eq!(cluster.pods(Some(&query), "ns1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_not_ready() {
        let cluster = KubeCluster::default();
        assert!(matches!(
            cluster.namespaces(None).await,
            Err(Error::NotReady("namespaces"))
        ));
    }

    #[test]
    fn test_service_info() {
        let svc = service(
            "ns1",
            "api",
            json!({"app": "api"}),
            "10.96.0.10",
            json!([
                {"port": 80, "targetPort": 8080, "protocol": "TCP"},
                {"port": 443, "targetPort": "https"},
            ]),
        );
        let info = ServiceInfo::from(&svc);
        assert_eq!(info.cluster_ip.as_deref(), Some("10.96.0.10"));
        assert_eq!(info.ports[0].target_port, Some(8080));
        assert_eq!(info.ports[1].protocol, "TCP");
        assert_eq!(info.ports[1].target_port, None);

        let headless = service("ns1", "db", json!({}), "None", json!([]));
        assert_eq!(ServiceInfo::from(&headless).cluster_ip, None);
    }
}
