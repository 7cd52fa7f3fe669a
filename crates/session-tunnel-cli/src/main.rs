//! Session tunnel CLI - forward a local port to an instance through the session broker

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_tunnel::{
    AwsCliAuthorizer, PluginBroker, StateBag, Step, StepAction, TracingUi, TunnelError,
    TunnelStep, Ui, STATE_CANCELLED, STATE_ERROR, STATE_INSTANCE, STATE_SESSION_PORT, STATE_UI,
};
use session_tunnel_cli::config::{Settings, TunnelFile};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Forward a local port to a remote instance without inbound access
#[derive(Parser, Debug)]
#[command(name = "session-tunnel")]
#[command(about = "Port forwarding to instances through the session manager", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// YAML file with tunnel settings (flags take precedence)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// AWS region of the instance
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Target instance id
    #[arg(long)]
    instance_id: Option<String>,

    /// Availability zone of the instance
    #[arg(long)]
    availability_zone: Option<String>,

    /// Port on the instance to forward to
    #[arg(long)]
    remote_port: Option<u16>,

    /// Local port, 0 picks a free port between 8000 and 9000
    #[arg(short = 'p', long)]
    local_port: Option<u16>,

    /// Login user on the instance
    #[arg(short = 'u', long)]
    ssh_username: Option<String>,

    /// Private key whose public half is pushed to the instance on every reconnect
    #[arg(long)]
    ssh_private_key_file: Option<PathBuf>,

    /// Key pair registered with the instance; disables key pushing
    #[arg(long)]
    ssh_keypair_name: Option<String>,

    /// Seconds to wait before opening the session
    #[arg(long)]
    pause_before: Option<u64>,

    /// AWS CLI executable
    #[arg(long, env = "SESSION_TUNNEL_AWS_PROGRAM")]
    aws_program: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> TunnelFile {
        TunnelFile {
            region: self.region.clone(),
            instance_id: self.instance_id.clone(),
            availability_zone: self.availability_zone.clone(),
            remote_port: self.remote_port,
            local_port: self.local_port,
            ssh_username: self.ssh_username.clone(),
            ssh_private_key_file: self.ssh_private_key_file.clone(),
            ssh_keypair_name: self.ssh_keypair_name.clone(),
            pause_before_seconds: self.pause_before,
            aws_program: self.aws_program.clone(),
        }
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "session_tunnel={},session_tunnel_cli={}",
            log_level, log_level
        )
        .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let file = match &cli.config {
        Some(path) => TunnelFile::load(path)?,
        None => TunnelFile::default(),
    };
    let settings = file
        .merge(cli.overrides())
        .into_settings()
        .context("Invalid arguments")?;

    run(settings).await
}

async fn run(settings: Settings) -> Result<()> {
    let ui: Arc<dyn Ui> = Arc::new(TracingUi);
    let mut state = StateBag::new();
    state.put(STATE_UI, ui);
    state.put(STATE_INSTANCE, settings.instance.clone());

    let broker = PluginBroker::new().with_program(settings.aws_program.clone());
    let authorizer =
        AwsCliAuthorizer::new(settings.step.region.clone()).with_program(settings.aws_program);
    let mut step = TunnelStep::new(settings.step, Arc::new(broker), Arc::new(authorizer));

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                cancel.cancel();
            }
        }
    });

    let action = step.run(&cancel, &mut state).await;

    if action == StepAction::Halt {
        step.cleanup(&mut state);
        signal_task.abort();

        if state.get::<bool>(STATE_CANCELLED).copied().unwrap_or(false) {
            info!("Stopped before the session was opened");
            return Ok(());
        }
        match state.get::<TunnelError>(STATE_ERROR) {
            Some(err) => bail!("{}", err),
            None => bail!("tunnel step halted"),
        }
    }

    if let Some(port) = state.get::<u16>(STATE_SESSION_PORT) {
        info!(
            "✅ Tunnel to {} ready on local port {}",
            settings.instance.instance_id, port
        );
    }

    let ended_on_its_own = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = step.finished() => true,
    };

    step.shutdown(&mut state, SHUTDOWN_GRACE).await;
    signal_task.abort();

    if ended_on_its_own {
        warn!("Session ended without being stopped");
        bail!("session to {} ended", settings.instance.instance_id);
    }

    info!("Tunnel closed");
    Ok(())
}
