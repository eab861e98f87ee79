use bulletproof_vpn::config::{Config, ConnectionSettings, get_config_path};
use bulletproof_vpn::console::{self, Console};
use bulletproof_vpn::control::protocol::{Integration, Provider};
use bulletproof_vpn::control::{ControlPlane, ControlPlaneClient};
use bulletproof_vpn::reconcile::Reconciler;
use bulletproof_vpn::state::DaemonSnapshot;
use bulletproof_vpn::{Orchestrator, SharedState, Supervisor};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "bulletproof")]
#[command(about = "Desktop controller for the bulletproofd VPN daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/bulletproof/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and control it from this terminal
    Run {
        /// Connect as soon as the daemon is healthy
        #[arg(long)]
        connect: bool,

        /// Upstream provider: warp, gool or psiphon
        #[arg(long)]
        provider: Option<Provider>,

        /// Two-letter exit country code
        #[arg(long)]
        exit_country: Option<String>,

        /// Upstream server host
        #[arg(long)]
        server: Option<String>,

        /// Upstream server port
        #[arg(long)]
        port: Option<u16>,

        /// System integration: direct, pac or tun
        #[arg(long)]
        integration: Option<Integration>,
    },
    /// Show daemon status
    Status,
    /// Dump daemon diagnostics
    Diag,
    /// Show the WARP identity
    Identity {
        /// Delete the identity so the next connect registers a new one
        #[arg(long)]
        reset: bool,
    },
    /// Fetch a page through the daemon's proxy
    ProxyTest {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Check whether the local proxy port accepts connections
    Probe {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(get_config_path);
    let config = Config::load_or_default(&config_path)?;

    match cli.command {
        Commands::Run {
            connect,
            provider,
            exit_country,
            server,
            port,
            integration,
        } => {
            let mut settings = config.connection.clone();
            if let Some(provider) = provider {
                settings.provider = provider;
            }
            if let Some(country) = exit_country {
                settings.exit_country = Some(country);
            }
            if let Some(server) = server {
                settings.server = Some(server);
            }
            if let Some(port) = port {
                settings.port = Some(port);
            }
            if let Some(integration) = integration {
                settings.integration = integration;
            }
            run(config, settings, connect).await?;
        }
        Commands::Status => {
            let status = client(&config)?.get_status().await;
            if let Some(e) = status.error {
                error!("Status failed: {}", e);
                std::process::exit(1);
            }
            println!(
                "Daemon Status: {}",
                if status.connected { "Connected" } else { "Not connected" }
            );
            if let Some(bind) = status.bind {
                println!("  Bind: {}", bind);
            }
            if let Some(message) = status.message {
                println!("  Message: {}", message);
            }
            if let Some(provider) = status.provider {
                println!("  Provider: {}", provider);
            }
            println!("  System proxy: {}", status.system_proxy);
            println!("  TUN: {}", status.tun_active);
        }
        Commands::Diag => {
            let reply = client(&config)?.get_diagnostics().await;
            if let Some(e) = reply.error {
                error!("Diagnostics failed: {}", e);
                std::process::exit(1);
            }
            println!("{}", serde_json::to_string_pretty(&reply.body)?);
        }
        Commands::Identity { reset } => {
            let client = client(&config)?;
            if reset {
                if let Some(e) = client.reset_identity().await.error {
                    error!("Identity reset failed: {}", e);
                    std::process::exit(1);
                }
                println!("Identity reset");
                return Ok(());
            }
            let reply = client.get_identity().await;
            match (reply.error, reply.identity) {
                (Some(e), _) => {
                    error!("Identity lookup failed: {}", e);
                    std::process::exit(1);
                }
                (None, Some(identity)) if identity.exists => {
                    println!("Identity: present");
                    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
                    println!("  Device: {}", show(&identity.device_id));
                    println!("  Account: {}", show(&identity.account_id));
                    println!("  Public key: {}", show(&identity.public_key));
                    println!("  Private key stored: {}", identity.has_private_key);
                    println!("  Token stored: {}", identity.has_token);
                    println!("  Path: {}", show(&identity.path));
                }
                _ => println!("Identity: none registered"),
            }
        }
        Commands::ProxyTest { bind } => {
            let reply = client(&config)?.test_proxy(bind.as_deref()).await;
            if let Some(e) = reply.error {
                error!("Proxy test failed: {}", e);
                std::process::exit(1);
            }
            println!("{}", reply.status_line.unwrap_or_default());
            if let Some(body) = reply.body {
                println!("{}", body);
            }
        }
        Commands::Probe { bind } => {
            let bind = bind.unwrap_or_else(|| config.probe.default_bind.clone());
            let probe = client(&config)?.probe_port(Some(&bind)).await;
            println!(
                "{}: {}",
                bind,
                if probe.listening { "listening" } else { "not listening" }
            );
            if !probe.listening {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            println!("# {}", config_path.display());
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

fn client(config: &Config) -> Result<ControlPlaneClient, Box<dyn std::error::Error>> {
    Ok(ControlPlaneClient::new(
        &config.daemon.listen,
        config.daemon.request_timeout(),
    )?)
}

/// Supervise the daemon and drive it from the console until quit or a signal
async fn run(
    config: Config,
    settings: ConnectionSettings,
    connect_now: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = settings.to_request()?;

    let supervisor = Arc::new(Supervisor::new(config.supervisor_config())?);
    let plane: Arc<dyn ControlPlane> = Arc::new(client(&config)?);
    let state = SharedState::new();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&plane),
        state.clone(),
        config.timings.clone(),
    ));

    match supervisor.start() {
        Ok(daemon) => info!("Supervising daemon pid {}", daemon.pid),
        Err(e) => error!("Daemon not started: {}", e),
    }

    let reconciler = Reconciler::new(
        Arc::clone(&plane),
        state.clone(),
        orchestrator.in_flight_flag(),
        config.timings.clone(),
        config.probe.clone(),
    )
    .spawn();
    let printer = console::spawn_state_printer(Arc::clone(&orchestrator));
    let exit_watch = spawn_exit_watch(&supervisor, state.clone());

    let startup = {
        let supervisor = Arc::clone(&supervisor);
        let plane = Arc::clone(&plane);
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if !supervisor.is_running() {
                return;
            }
            let healthy = supervisor.wait_healthy(plane.as_ref()).await.is_ok();
            if connect_now && healthy {
                orchestrator.connect(request).await;
            }
        })
    };

    let console = Console::new(Arc::clone(&orchestrator), Arc::clone(&plane), settings);
    wait_for_shutdown(&console).await?;

    startup.abort();
    reconciler.abort();
    printer.abort();
    exit_watch.abort();

    supervisor.stop().await;
    Ok(())
}

/// Mark the daemon gone as soon as its process exits
fn spawn_exit_watch(
    supervisor: &Supervisor,
    state: SharedState,
) -> tokio::task::JoinHandle<()> {
    let mut alive = supervisor.subscribe();
    tokio::spawn(async move {
        while alive.changed().await.is_ok() {
            if alive.borrow_and_update().is_none() {
                warn!("Daemon process exited");
                state.update(|s| s.daemon = DaemonSnapshot::default());
            }
        }
    })
}

async fn wait_for_shutdown(console: &Console) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = console.run() => {
                info!("Quit requested");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt signal");
                println!("\nShutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = console.run() => {
                info!("Quit requested");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt signal");
                println!("\nShutting down...");
            }
        }
    }
    Ok(())
}
