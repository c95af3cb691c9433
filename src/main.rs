use clap::Parser;
use eyre::format_err;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::{Client, runtime::watcher};
use log::{error, info};
use std::process::exit;
use std::sync::Arc;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};

use pcn_k8s::{
    cluster::KubeCluster,
    controllers::{Controller, Handler},
    crd::PolycubeNetworkPolicy,
    firewall::manager::FirewallManager,
    keys,
    manager::{self, NetworkPolicyManager},
    queue::Queue,
    resolver::Resolver,
    sink::polycube::Polycube,
    store::Store,
};

pub mod config;

/// Polycube network policy controller
#[derive(Parser)]
#[command(version = VERSION, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "PCN_K8S_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "PCN_K8S_LOG_STYLE")]
    log_style: String,

    /// my node name (hint: {valueFrom: {fieldRef: { fieldPath: spec.nodeName }}})
    #[arg(
        long,
        env = "NODE_NAME",
        default_value_t = default_nodename()
    )]
    node_name: String,

    /// Config file path.
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,
}

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")");

const ABOUT: &str = r#"
Polycube network policy controller

Watch the Kubernetes API server and enforce NetworkPolicies and PolycubeNetworkPolicies on the
pods of this node, through the firewalls of the local polycube daemon.
"#;

fn default_nodename() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|s| s.to_string_lossy().into_owned())
}

type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;

type Manager = NetworkPolicyManager<Polycube, KubeCluster>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    use config::*;
    let config = tokio::fs::read(&cli.config)
        .await
        .map_err(|e| format_err!("read config failed: {}: {e}", cli.config))?;
    let config: Config =
        serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?;

    let cluster_url = config
        .cluster_url()
        .map_err(|e| format_err!("invalid cluster_url: {e}"))?;
    let vpods = config
        .vpods_range()
        .map_err(|e| format_err!("invalid vpods_range: {e}"))?;

    if cli.test_config {
        return Ok(());
    }

    info!("pcn-k8s {VERSION} starting as node {}", cli.node_name);

    let mut kube_cfg = kube::Config::infer().await?;
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);

    let kube: Client = kube_cfg.try_into()?;
    let watcher_config = watcher::Config::default();

    match &config.namespace {
        None => info!("watching all namespaces"),
        Some(ns) => info!("watching namespace {ns}"),
    };

    let ctx = Arc::new(pcn_k8s::Context {
        node_name: cli.node_name,
        namespace: config.namespace.clone(),
        kube,
    });

    let sink = Polycube::new(&config.polycube_url, config.request_timeout())
        .map_err(|e| format_err!("polycube client setup failed: {e}"))?;
    info!("polycube at {}", config.polycube_url);

    let cluster = KubeCluster::default();
    let backoff = config.backoff();

    let pods = Controller::new("pod", cluster.pods.clone(), backoff);
    let namespaces = Controller::new("namespace", cluster.namespaces.clone(), backoff);
    let services = Controller::new("service", cluster.services.clone(), backoff);
    let k8s_policies = Controller::new("networkpolicy", Store::<NetworkPolicy>::new(), backoff);
    let pcn_policies =
        Controller::new("polycubenetworkpolicy", Store::<PolycubeNetworkPolicy>::new(), backoff);

    let manager: Arc<Manager> = Arc::new(NetworkPolicyManager::new(
        manager::Config {
            node_name: ctx.node_name.clone(),
            ignored_namespaces: config.ignored_namespaces.iter().cloned().collect(),
        },
        Resolver::new(Arc::new(cluster), vpods),
        FirewallManager::new(Arc::new(sink)),
        k8s_policies.store.clone(),
        pcn_policies.store.clone(),
    ));

    let queues: Vec<Queue<keys::Object>> = vec![
        pods.queue.clone(),
        namespaces.queue.clone(),
        services.queue.clone(),
        k8s_policies.queue.clone(),
        pcn_policies.queue.clone(),
    ];

    tokio::spawn(async move {
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("failed to install signal handlers");
            return;
        };
        select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        };
        for queue in queues {
            queue.shut_down().await;
        }
    });

    pods.watch(ctx.namespaced_api(), watcher_config.clone());
    namespaces.watch(ctx.cluster_api(), watcher_config.clone());
    services.watch(ctx.namespaced_api(), watcher_config.clone());
    k8s_policies.watch(ctx.namespaced_api(), watcher_config.clone());
    pcn_policies.watch(ctx.namespaced_api(), watcher_config);

    tokio::spawn(
        manager
            .clone()
            .janitor(config.janitor_interval(), config.idle_timeout()),
    );

    let mut tasks = Tasks::new();
    let max_retries = config.max_retries;

    spawn_worker(&mut tasks, pods, &manager, max_retries);
    spawn_worker(&mut tasks, namespaces, &manager, max_retries);
    spawn_worker(&mut tasks, services, &manager, max_retries);
    spawn_worker(&mut tasks, k8s_policies, &manager, max_retries);
    spawn_worker(&mut tasks, pcn_policies, &manager, max_retries);

    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => {
                error!("task wait failed: {e}");
            }
            Ok((name, Ok(_))) => {
                info!("task {name} finished");
                continue;
            }
            Ok((name, Err(e))) => {
                error!("task {name} finished with error: {e}");
            }
        }
        exit(1);
    }

    info!("all workers stopped");
    Ok(())
}

fn spawn_worker<K>(tasks: &mut Tasks, controller: Controller<K>, manager: &Arc<Manager>, max_retries: u32)
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    Manager: Handler<K>,
{
    let task_name = format!("{}-worker", controller.kind);
    let task = controller.work(manager.clone(), max_retries);
    tasks.spawn(async move { (task_name, task.await) });
}
