pub mod change;
pub mod cluster;
pub mod controllers;
pub mod crd;
pub mod firewall;
pub mod keys;
pub mod manager;
pub mod parsers;
pub mod priority;
pub mod queue;
pub mod resolver;
pub mod sink;
pub mod store;
pub mod templates;
pub mod types;

use kube::api::Api;

pub struct Context {
    pub node_name: String,
    pub namespace: Option<String>,
    pub kube: kube::Client,
}

impl Context {
    /// API on the watched namespace, or all of them.
    pub fn namespaced_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            None => Api::all(self.kube.clone()),
            Some(ns) => Api::namespaced(self.kube.clone(), ns.as_str()),
        }
    }

    pub fn cluster_api<K>(&self) -> Api<K>
    where
        K: kube::Resource,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::all(self.kube.clone())
    }
}
