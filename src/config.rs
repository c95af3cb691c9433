use cidr::Ipv4Cidr;
use eyre::Result;
use pcn_k8s::{queue::Backoff, sink::polycube};
use std::time::Duration;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Namespace to watch instead of the whole cluster.
    pub namespace: Option<String>,

    /// Kubernetes API server URL
    pub cluster_url: Option<String>,

    /// Base URL of the local polycube REST service
    #[serde(default = "default_polycube_url")]
    pub polycube_url: String,

    /// Timeout of polycube requests, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Virtual (NAT-rewritten) pod range. Incoming rules also match the virtual address of their
    /// peers when set.
    pub vpods_range: Option<String>,

    /// Namespaces whose pods never get a firewall
    #[serde(default = "default_ignored_namespaces")]
    pub ignored_namespaces: Vec<String>,

    /// How many times a failed change is retried before being dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Seconds a firewall may monitor no pod before being destroyed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds between idle firewall sweeps
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval: u64,
}

fn default_polycube_url() -> String {
    polycube::DEFAULT_URL.into()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_ignored_namespaces() -> Vec<String> {
    vec!["kube-system".into()]
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    5
}
fn default_max_delay_ms() -> u64 {
    1_000_000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_janitor_interval() -> u64 {
    30
}

impl Config {
    /// parse the cluster_url
    pub fn cluster_url(&self) -> Result<Option<http::Uri>> {
        match self.cluster_url {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }

    /// parse the vpods_range
    pub fn vpods_range(&self) -> Result<Option<Ipv4Cidr>> {
        match self.vpods_range {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.base_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval.max(1))
    }
}
