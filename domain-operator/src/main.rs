mod domain;
mod engine;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use clap::Parser;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use domain::make_right::MakeRightEngine;
use domain::status::run_status_updater;
use domain::tuning::Tuning;
use engine::dispatcher::{WatchDispatcher, WatchScope};
use engine::fiber_gate::FiberGate;
use engine::presence::PresenceCache;
use util::colors::{FG1, FG2};

const TUNING_CONFIG_MAP_NAME: &str = "weblogic-operator-cm";
const LEASE_NAME: &str = "weblogic-domain-operator-lock";

/// Command-line surface for the WebLogic Domain Reconciliation Engine
/// (spec.md §11 "External Interfaces"). Every flag doubles as an env
/// var so the same binary runs unchanged from a Deployment manifest.
#[derive(Parser, Debug)]
#[command(name = "weblogic-domain-operator", version)]
struct Cli {
    /// Namespace to watch Domain resources in. May be repeated; omit
    /// entirely to watch every namespace the operator's RBAC allows.
    #[arg(long = "namespace", env = "WATCH_NAMESPACE", value_delimiter = ',')]
    namespace: Vec<String>,

    /// Namespace holding the leader-election Lease and the
    /// `weblogic-operator-cm` tuning ConfigMap.
    #[arg(long, env, default_value = "weblogic-operator-system")]
    leader_election_namespace: String,

    #[arg(long, env, default_value = "8080")]
    metrics_port: u16,

    #[command(flatten)]
    tuning: Tuning,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weblogic_operator_common::init();
    let cli = Cli::parse();
    let client = Client::try_default().await?;
    run(client, cli).await
}

/// Generalizes the teacher's acquire-or-renew-on-a-tick leadership loop
/// (storage-operator's `clusters::reconcile::run`) from a single
/// `kube::runtime::Controller` task to the watch-dispatcher/fiber-gate
/// stack this engine drives instead.
async fn run(client: Client, cli: Cli) -> anyhow::Result<()> {
    let tuning = Arc::new(ArcSwap::from_pointee(cli.tuning));
    let presence = Arc::new(PresenceCache::new());

    #[cfg(feature = "metrics")]
    let metrics = Arc::new(util::metrics::EngineMetrics::new("weblogic_domain_operator"));
    #[cfg(feature = "metrics")]
    {
        let metrics = metrics.clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.metrics_port));
        tokio::spawn(async move {
            if let Err(err) = util::metrics::serve(metrics, addr).await {
                eprintln!("{}", format!("metrics server exited: {err}").color(FG2));
            }
        });
    }

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        weblogic_operator_common::shutdown::shutdown_signal().await;
        shutdown_for_signal.cancel();
    });

    tokio::spawn(watch_tuning_config_map(
        client.clone(),
        cli.leader_election_namespace.clone(),
        tuning.clone(),
    ));

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("weblogic-domain-operator-{}", uuid::Uuid::new_v4()));

    let leadership = LeaseLock::new(
        client.clone(),
        &cli.leader_election_namespace,
        LeaseLockParams { holder_id, lease_name: LEASE_NAME.to_string(), lease_ttl: Duration::from_secs(15) },
    );

    weblogic_operator_common::signal_ready();
    println!("{}", "weblogic-domain-operator ready".color(FG1));

    let mut engine: Option<(tokio::task::JoinHandle<()>, CancellationToken)> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((task, cancel)) = engine.take() {
                    cancel.cancel();
                    let _ = task.await;
                }
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(err) => {
                eprintln!("{}", format!("leader election renew failed: {err}").color(FG2));
                if let Some((task, cancel)) = engine.take() {
                    cancel.cancel();
                    let _ = task.await;
                }
                continue;
            }
        };

        match lease {
            LeaseLockResult::Acquired(_) if engine.is_none() => {
                println!("{}", "acquired leadership, starting engine".color(FG1));
                let cancel = CancellationToken::new();
                let task = tokio::spawn(run_engine(
                    client.clone(),
                    cli.namespace.clone(),
                    presence.clone(),
                    tuning.clone(),
                    cancel.clone(),
                    #[cfg(feature = "metrics")]
                    metrics.clone(),
                ));
                engine = Some((task, cancel));
            }
            LeaseLockResult::Acquired(_) => {}
            _ => {
                if let Some((task, cancel)) = engine.take() {
                    println!("{}", "lost leadership, stopping engine".color(FG2));
                    cancel.cancel();
                    let _ = task.await;
                }
            }
        }
    }
}

/// Starts one watch-dispatcher/make-right-gate/status-gate/status-updater
/// group per watched namespace (or a single `AllNamespaces` group), all
/// sharing the one process-wide presence cache, and tears every task
/// down when `cancel` fires.
async fn run_engine(
    client: Client,
    namespaces: Vec<String>,
    presence: Arc<PresenceCache>,
    tuning: Arc<ArcSwap<Tuning>>,
    cancel: CancellationToken,
    #[cfg(feature = "metrics")] metrics: Arc<util::metrics::EngineMetrics>,
) {
    let scopes: Vec<(String, WatchScope)> = if namespaces.is_empty() {
        vec![("all".to_string(), WatchScope::AllNamespaces)]
    } else {
        namespaces.iter().map(|ns| (ns.clone(), WatchScope::Namespace(ns.clone()))).collect()
    };

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for (label, scope) in scopes {
        let make_right_gate = Arc::new(FiberGate::new(label.clone()));
        let status_gate = Arc::new(FiberGate::new(label.clone()));
        let make_right = MakeRightEngine::new(
            client.clone(),
            presence.clone(),
            make_right_gate,
            tuning.clone(),
            #[cfg(feature = "metrics")]
            metrics.clone(),
        );
        let dispatcher = WatchDispatcher::new(client.clone(), scope, make_right, presence.clone());

        handles.extend(dispatcher.spawn_all(cancel.clone()));
        handles.push(tokio::spawn(run_status_updater(
            client.clone(),
            label,
            presence.clone(),
            status_gate,
            tuning.clone(),
            shutdown_flag.clone(),
        )));
    }

    cancel.cancelled().await;
    shutdown_flag.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.abort();
    }
}

/// Watches the `weblogic-operator-cm` ConfigMap in the leader-election
/// namespace and folds any present keys into the live `Tuning`, the same
/// "watch one ConfigMap, merge what's present" shape spec.md §6
/// describes for `mainTuning`.
async fn watch_tuning_config_map(client: Client, namespace: String, tuning: Arc<ArcSwap<Tuning>>) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={TUNING_CONFIG_MAP_NAME}"));
    let mut stream = watcher::watcher(api, config).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(cm) | Event::InitApply(cm)) => {
                if let Some(data) = &cm.data {
                    let merged = tuning.load().merge_from_config_map(data);
                    tuning.store(Arc::new(merged));
                }
            }
            Ok(_) => {}
            Err(err) => eprintln!("{}", format!("tuning config map watch error: {err}").color(FG2)),
        }
    }
}
