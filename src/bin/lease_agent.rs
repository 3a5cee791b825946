use clap::{Parser, Subcommand};
use lease_agent::config::AgentConfig;
use lease_agent::dispatcher::{EventDispatcher, RequestQueue, ResponseSink, RpcRequestQueue, RpcResponseSink};
use lease_agent::error::AgentResult;
use lease_agent::lease::LeaseManager;
use lease_agent::orchestrator::{KubectlOrchestrator, OrchestratorAdapter};
use lease_agent::rpc::{HttpChannel, RpcClient};
use lease_agent::signing::{Ed25519Signer, MessageSigner};
use lease_agent::tracker::Tracker;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and serve lease requests until interrupted
    Start {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config } => match start(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("[-] failed to start - {}", e);
                eprintln!("lease_agent: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn load_signer(config: &AgentConfig) -> AgentResult<Arc<dyn MessageSigner>> {
    match &config.agent.secret_key {
        Some(secret) => Ok(Arc::new(Ed25519Signer::from_hex(secret)?)),
        None => {
            warn!("[-] no secret key configured, using an ephemeral key");
            Ok(Arc::new(Ed25519Signer::generate()))
        }
    }
}

async fn start(config_path: Option<PathBuf>) -> AgentResult<()> {
    let config = AgentConfig::resolve(config_path.as_deref())?;
    lease_agent::logging::init(&config.logging).ok();
    config.validate()?;

    let signer = load_signer(&config)?;
    let cluster_key = format!("{}@{}", signer.address(), config.agent.cluster_name);
    info!("[+] starting lease agent <cluster: {}>", cluster_key);

    let orchestrator: Arc<dyn OrchestratorAdapter> = Arc::new(KubectlOrchestrator::new(
        config.orchestrator.clone(),
        config.domain(),
    ));
    let manager = Arc::new(LeaseManager::new(orchestrator, &config.lease));
    let client = Arc::new(RpcClient::connect(&config.rpc).await?);

    let sink: Arc<dyn ResponseSink> = Arc::new(RpcResponseSink::new(
        Arc::clone(&client),
        config.dispatcher.response_method.clone(),
        config.dispatcher.expiry_method.clone(),
    ));
    let queue: Arc<dyn RequestQueue> = Arc::new(RpcRequestQueue::new(
        Arc::clone(&client),
        cluster_key,
        config.dispatcher.listen_method.clone(),
        config.dispatcher.unlisten_method.clone(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&manager),
        sink,
        Arc::clone(&signer),
        config.dispatcher.resubscribe_interval(),
    ));
    let dispatcher = dispatcher.start(queue).await?;

    let tracker = if config.tracker.enabled {
        let tracker_client = match &config.tracker.endpoint {
            Some(endpoint) => Arc::new(RpcClient::with_channel(
                Arc::new(HttpChannel::new(endpoint.clone())),
                config.rpc.call_timeout(),
            )),
            None => Arc::clone(&client),
        };
        let tracker = Arc::new(Tracker::new(
            tracker_client,
            Arc::clone(&signer),
            Arc::clone(&manager),
            &config,
        ));
        match tracker.start().await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("[-] tracker registration failed - {}", e);
                None
            }
        }
    } else {
        None
    };

    info!("[+] lease agent running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("[-] shutting down");

    if let Some(tracker) = tracker {
        tracker.stop();
    }
    dispatcher.stop().await;
    if let Err(e) = manager.cleanup().await {
        error!("[-] cleanup incomplete - {}", e);
    }
    client.close().await;
    Ok(())
}
