use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use node_informer::apis::NodeSlo;
use node_informer::cache::KubeWatchSource;
use node_informer::config::Cli;
use node_informer::config::Commands;
use node_informer::config::DaemonArgs;
use node_informer::config::InformerConfig;
use node_informer::kube_client;
use node_informer::kubelet::HttpKubeletConnector;
use node_informer::pleg::CgroupPleg;
use node_informer::InformerSources;
use node_informer::NodeInformer;
use node_informer::ObjectKind;
use node_informer::StatesReader;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting node informer {}", &**version::VERSION);

    let config = InformerConfig::from(&daemon_args);
    let client = kube_client::init_kube_client(daemon_args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;

    let pleg = Arc::new(CgroupPleg::new(
        config.cgroup_root_dir.clone(),
        config.cgroup_driver,
    ));
    let sources = InformerSources {
        node_watch: Arc::new(KubeWatchSource::<Node>::for_node(
            client.clone(),
            &config.node_name,
        )),
        node_slo_watch: Arc::new(KubeWatchSource::<NodeSlo>::for_node(
            client,
            &config.node_name,
        )),
        kubelet_connector: Arc::new(HttpKubeletConnector::new(
            config.token_path.clone(),
            config.kubelet_sync_timeout,
        )),
        pleg: pleg.clone(),
    };

    let informer = NodeInformer::new(config, sources)
        .map_err(|e| anyhow::anyhow!("Invalid informer configuration: {e:?}"))?;
    register_builtin_callbacks(&informer)?;

    let cancellation_token = CancellationToken::new();
    let pleg_task = {
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            if let Err(e) = pleg.run(token).await {
                tracing::warn!("Pod lifecycle events unavailable, relying on polling: {e:?}");
            }
        })
    };
    let signal_task = spawn_signal_handler(cancellation_token.clone())?;

    let result = informer.run(cancellation_token.clone()).await;

    cancellation_token.cancel();
    signal_task.abort();
    if let Err(e) = pleg_task.await {
        tracing::error!("Pod lifecycle task failed during shutdown: {e}");
    }

    result.map_err(|e| anyhow::anyhow!("Node informer failed: {e:?}"))
}

fn register_builtin_callbacks(informer: &NodeInformer) -> Result<()> {
    informer
        .register_callback(
            ObjectKind::Node,
            "log-node-update",
            "log a summary of the node after each update",
            |states: &dyn StatesReader| {
                if let Some(node) = states.get_node() {
                    tracing::info!(
                        name = node.metadata.name.as_deref().unwrap_or_default(),
                        resource_version = node.metadata.resource_version.as_deref().unwrap_or_default(),
                        pods = states.get_all_pods().len(),
                        "node updated"
                    );
                }
                Ok(())
            },
        )
        .map_err(|e| anyhow::anyhow!("Failed to register node callback: {e:?}"))?;

    informer
        .register_callback(
            ObjectKind::NodeSlo,
            "log-node-slo-update",
            "log a summary of the node SLO after each update",
            |states: &dyn StatesReader| {
                if let Some(node_slo) = states.get_node_slo() {
                    let threshold = node_slo
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.resource_used_threshold_with_be.as_ref());
                    tracing::info!(
                        name = node_slo.metadata.name.as_deref().unwrap_or_default(),
                        be_suppress_enabled = ?threshold.and_then(|t| t.enable),
                        "node SLO updated"
                    );
                }
                Ok(())
            },
        )
        .map_err(|e| anyhow::anyhow!("Failed to register node SLO callback: {e:?}"))?;

    Ok(())
}

fn spawn_signal_handler(cancellation_token: CancellationToken) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        cancellation_token.cancel();
    }))
}
