//! Remote Control Agent binary.
//!
//! With no arguments the process runs under the Windows service
//! dispatcher (and as a plain console daemon elsewhere). Subcommands:
//!
//! ```text
//! rc-agent install     Install the Windows service
//! rc-agent uninstall   Uninstall the Windows service
//! rc-agent start       Start the service
//! rc-agent stop        Stop the service
//! rc-agent status      Show service status
//! rc-agent console     Run in the foreground (any OS)
//! rc-agent help        Show usage
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use rc_agent::agent::Agent;
use rc_agent::audio::HeadlessAudio;
use rc_agent::config::{self, Settings};
use rc_agent::{http, platform};

#[cfg(windows)]
mod service;

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();

    #[cfg(windows)]
    if args.len() < 2 {
        info!("starting as Windows service");
        return service::dispatch();
    }

    let command = args
        .get(1)
        .map(|arg| arg.to_lowercase())
        .unwrap_or_else(|| "console".to_string());

    match command.as_str() {
        "console" | "run" => run_console(),

        #[cfg(windows)]
        "install" => {
            service::install()?;
            println!("Service installed successfully.");
            Ok(())
        }

        #[cfg(windows)]
        "uninstall" => {
            let _ = service::stop();
            service::uninstall()?;
            println!("Service uninstalled successfully.");
            Ok(())
        }

        #[cfg(windows)]
        "start" => {
            service::start()?;
            println!("Service started successfully.");
            Ok(())
        }

        #[cfg(windows)]
        "stop" => {
            service::stop()?;
            println!("Service stopped successfully.");
            Ok(())
        }

        #[cfg(windows)]
        "status" => service::print_status(),

        "help" | "-h" | "--help" => {
            print_help(&args[0]);
            Ok(())
        }

        _ => {
            eprintln!("Unknown command: {}", command);
            print_help(&args[0]);
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rc_agent=info")),
        )
        .init();
}

/// Load configuration and identity, assemble the agent.
fn build_agent() -> Result<Arc<Agent>> {
    let data_dir = config::data_dir();
    let settings = Settings::load_or_init(&data_dir.join("settings.toml"))?;
    let agent_id = config::get_or_create_agent_id(&data_dir.join("agent-id.json"))?;

    let platform = platform::native();
    // The OS mixer binding is provisioned by the installer build; the
    // in-process mixer keeps the audio surface alive without it.
    let audio = Arc::new(HeadlessAudio::new());

    Ok(Agent::new(agent_id.as_str(), settings, platform, audio))
}

/// Run in the foreground until Ctrl+C.
fn run_console() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    runtime.block_on(async {
        let agent = build_agent()?;
        agent.start();

        // Failure to bind the control-plane port is fatal and propagates
        // to the supervisor.
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", agent.settings.listen_port))
                .await
                .with_context(|| {
                    format!("failed to bind listen port {}", agent.settings.listen_port)
                })?;

        let server = tokio::spawn(http::serve(
            Arc::clone(&agent),
            listener,
            agent.shutdown_token(),
        ));

        info!("agent running, press Ctrl+C to stop");
        tokio::signal::ctrl_c().await.ok();

        info!("shutting down");
        agent.stop();
        server
            .await
            .context("server task panicked")?
            .context("server error")?;
        Ok(())
    })
}

fn print_help(program: &str) {
    println!(
        r#"Remote Control Agent

USAGE:
    {program} <COMMAND>

COMMANDS:
    install     Install the Windows service
    uninstall   Uninstall the Windows service
    start       Start the service
    stop        Stop the service
    status      Show service status
    console     Run in the foreground (for debugging)
    help        Show this help message

DESCRIPTION:
    Exposes a LAN control plane for this workstation: REST lifecycle
    endpoints, a desktop streaming channel with remote input, and audio
    and power control. Runs as LocalSystem so capture and input keep
    working at the login screen and on the lock screen.
"#
    );
}
