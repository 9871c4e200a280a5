use anyhow::{Context, Result};
use node_agent::cli::{
    Args, CheckpointQuery, ConfigDiscovery, ExecutionMode, RunConfig, TaskPayloadFile,
};
use node_agent::{
    Agent, AgentConfig, CheckpointStore, DockerRuntime, StdioChannel, read_inbound,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const INBOUND_QUEUE_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Run(config) => run_agent(config).await,
        ExecutionMode::ShowConfig { config_override } => show_config(config_override.as_deref()),
        ExecutionMode::Checkpoint(query) => show_checkpoint(query).await,
        ExecutionMode::Validate(path) => validate_payload(&path),
    }
}

/// Logs go to stderr: stdout carries the control-plane channel
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("node_agent=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(
    config_override: Option<&Path>,
    checkpoint_dir: Option<&Path>,
) -> Result<AgentConfig> {
    let mut config =
        ConfigDiscovery::load(config_override).context("Failed to load configuration")?;
    if let Some(dir) = checkpoint_dir {
        config.checkpoint.directory = dir.to_path_buf();
    }
    Ok(config)
}

async fn run_agent(run: RunConfig) -> Result<()> {
    let config = load_config(run.config_override.as_deref(), run.checkpoint_dir.as_deref())?;
    let payload = run
        .tasks_file
        .as_deref()
        .map(TaskPayloadFile::load)
        .transpose()
        .context("Failed to load task payload")?;

    let runtime = Arc::new(
        DockerRuntime::connect(&config.runtime)
            .await
            .context("Failed to connect to the container runtime")?,
    );
    let channel = Arc::new(StdioChannel::stdout());
    let agent = Arc::new(Agent::start(config, runtime, channel).await?);

    if let Some(payload) = payload {
        info!("Submitting {} task(s) from payload file", payload.tasks.len());
        agent.submit(payload.tasks, payload.seq_num).await;
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
    let reader = tokio::spawn(async move {
        if let Err(e) = read_inbound(BufReader::new(tokio::io::stdin()), inbound_tx).await {
            error!("Control-plane input failed: {}", e);
        }
    });
    let serving = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.serve(inbound_rx).await })
    };

    info!("Agent running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Ctrl-C received, shutting down gracefully...");

    reader.abort();
    serving.abort();
    agent.shutdown().await;
    Ok(())
}

fn show_config(config_override: Option<&Path>) -> Result<()> {
    if config_override.is_none() {
        ConfigDiscovery::show_discovery_info();
        println!();
    }
    let config = load_config(config_override, None)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn show_checkpoint(query: CheckpointQuery) -> Result<()> {
    let config = load_config(
        query.config_override.as_deref(),
        query.checkpoint_dir.as_deref(),
    )?;
    let store = CheckpointStore::new(&config.checkpoint.directory);

    let Some(checkpoint) = store.load().await? else {
        println!("No checkpoint at {}", store.path().display());
        return Ok(());
    };

    println!(
        "Checkpoint {} (version {}, saved {}): {} task(s)",
        store.path().display(),
        checkpoint.version,
        checkpoint.saved_at,
        checkpoint.tasks.len()
    );
    for task in &checkpoint.tasks {
        println!();
        println!(
            "{} [{}:{}] known={} desired={} seq={}",
            task.arn,
            task.family,
            task.version,
            task.known_status,
            task.desired_status,
            task.seq_num
        );
        if let Some(reason) = &task.stop_reason {
            println!("  reason: {}", reason);
        }
        for container in &task.containers {
            let exit = container
                .exit_code
                .map(|code| format!(" exit={}", code))
                .unwrap_or_default();
            println!(
                "  - {} known={} desired={}{} id={}",
                container.spec.name,
                container.known_status,
                container.desired_status,
                exit,
                container.runtime_id.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn validate_payload(path: &Path) -> Result<()> {
    let payload = TaskPayloadFile::load(path)?;
    let rejected = payload.validate();

    for spec in &payload.tasks {
        match rejected.iter().find(|(arn, _)| arn == &spec.arn) {
            Some((_, e)) => println!("INVALID {}: {}", spec.arn, e),
            None => println!("ok      {} ({} container(s))", spec.arn, spec.containers.len()),
        }
    }

    if rejected.is_empty() {
        println!("{} task(s) valid", payload.tasks.len());
        Ok(())
    } else {
        anyhow::bail!("{} of {} task(s) invalid", rejected.len(), payload.tasks.len())
    }
}
