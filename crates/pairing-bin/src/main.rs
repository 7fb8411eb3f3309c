//! Channel pairing CLI - links a messaging channel to the provider by pairing code.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use channel_pairing_orchestrator::{
    channel_id_from_name, state_label, status_label, InMemoryAgentStore, OrchestratorOptions,
    PairingEvent, PairingOrchestrator, PairingState, PairingSubscription,
};
use clap::{Parser, Subcommand};
use evolution_provider_client::{EvolutionClient, ProviderClient};
use pairing_config_and_utils::{init_logging, Config, LogFormat, Paths};
use tracing::{info, warn};

/// Channel pairing command-line interface.
#[derive(Parser)]
#[command(name = "channel-pairing")]
#[command(about = "Link messaging channels to the provider with a pairing code")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format (compact, json)
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Base directory for the config file. Defaults to $PAIRING_HOME, then ~/.channel-pairing
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair a channel and follow it until it connects or gives up
    Connect {
        /// Channel identifier as known to the provider
        #[arg(short, long, conflicts_with = "agent_name", required_unless_present = "agent_name")]
        channel: Option<String>,

        /// Agent display name; the channel id is derived from it
        #[arg(short, long)]
        agent_name: Option<String>,
    },
    /// Print the user-facing label for a provider status token
    Label {
        /// Raw status token (e.g. open, connecting, close)
        token: String,
    },
    /// Print the channel id derived from an agent name
    ChannelId {
        /// Agent display name
        name: String,
    },
    /// Check that the provider is reachable with the configured credentials
    Doctor,
    /// Print the effective configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = Paths::resolve(cli.base_dir)?;
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, cli.log_format);

    match cli.command {
        Commands::Connect {
            channel,
            agent_name,
        } => run_connect(&config, channel, agent_name).await?,
        Commands::Label { token } => println!("{}", status_label(&token)),
        Commands::ChannelId { name } => {
            let channel_id = channel_id_from_name(&name)
                .with_context(|| format!("no channel id can be derived from {name:?}"))?;
            println!("{channel_id}");
        }
        Commands::Doctor => run_doctor(&config).await?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

fn provider_client(config: &Config) -> anyhow::Result<EvolutionClient> {
    config.validate()?;
    if config.provider_api_key.is_none() {
        warn!("No provider API key configured; requests will likely be rejected");
    }
    let client = EvolutionClient::new(
        &config.provider_url,
        config.provider_api_key.clone().unwrap_or_default(),
        config.request_timeout(),
    )?;
    Ok(client)
}

async fn run_connect(
    config: &Config,
    channel: Option<String>,
    agent_name: Option<String>,
) -> anyhow::Result<()> {
    let provider = Arc::new(provider_client(config)?);
    let store = Arc::new(InMemoryAgentStore::new());
    let orchestrator = PairingOrchestrator::builder(provider, store.clone())
        .options(OrchestratorOptions::from_config(config))
        .build();

    let mut subscription = match (channel, agent_name) {
        (Some(channel), _) => orchestrator.connect(&channel)?,
        (None, Some(name)) => {
            let agent_id = store.insert(name);
            orchestrator.connect_agent(agent_id).await?
        }
        (None, None) => bail!("either --channel or --agent-name is required"),
    };

    info!(
        channel_id = %subscription.channel_id(),
        epoch = subscription.epoch(),
        "Pairing started"
    );

    let final_state = follow(&orchestrator, &mut subscription).await?;
    eprintln!("{}", state_label(&final_state));
    if final_state != PairingState::Connected {
        bail!("pairing ended in {final_state}");
    }
    Ok(())
}

/// Print events as JSON lines until the session reaches a terminal state.
/// Ctrl-C cancels the session and keeps reading so the final state is reported.
async fn follow(
    orchestrator: &PairingOrchestrator,
    subscription: &mut PairingSubscription,
) -> anyhow::Result<PairingState> {
    let channel_id = subscription.channel_id().to_string();
    if let Some(code) = subscription.pairing_code() {
        eprintln!("Pairing code: {}", code.code);
    }
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = subscription.next() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling pairing");
                orchestrator.cancel(&channel_id);
                continue;
            }
        };

        let Some(event) = event else {
            bail!("event stream for {channel_id} closed");
        };
        if event.epoch() != subscription.epoch() {
            continue;
        }

        println!("{}", serde_json::to_string(&event)?);
        if let PairingEvent::StateChanged {
            pairing_code: Some(code),
            ..
        } = &event
        {
            eprintln!("Pairing code: {}", code.code);
        }

        if let Some(state) = event.new_state().filter(PairingState::is_terminal) {
            return Ok(state);
        }
    }
}

async fn run_doctor(config: &Config) -> anyhow::Result<()> {
    let client = provider_client(config)?;
    client
        .health_check()
        .await
        .with_context(|| format!("provider at {} is not healthy", config.provider_url))?;
    println!("provider reachable at {}", config.provider_url);
    Ok(())
}
