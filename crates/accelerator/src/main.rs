use std::sync::Arc;
use std::time::Duration;

use accelerator::config::Cli;
use accelerator::config::Commands;
use accelerator::config::DaemonArgs;
use accelerator::config::PluginConfig;
use accelerator::logging;
use accelerator::runtime::probe_version;
use accelerator::runtime::DockerCliClient;
use accelerator::AcceleratorPlugin;
use accelerator::Drivers;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use utils::version;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

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
        Commands::Devices(daemon_args) => run_devices(*daemon_args).await,
        Commands::RuntimeVersion(daemon_args) => run_runtime_version(*daemon_args).await,
    }
}

async fn bootstrap(daemon_args: &DaemonArgs) -> Result<AcceleratorPlugin> {
    let config = PluginConfig::from(daemon_args);

    let drivers = tokio::task::spawn_blocking({
        let config = config.clone();
        move || Drivers::load(&config)
    })
    .await
    .context("driver loading task failed")?;
    let containers = Arc::new(DockerCliClient::new(
        &daemon_args.docker_binary,
        config.probe_timeout,
    ));

    AcceleratorPlugin::bootstrap(config, drivers, containers)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bootstrap accelerator plugin: {e:?}"))
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(&daemon_args.measurements_file)
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    tracing::info!("Starting accelerator agent {}", &**version::VERSION);

    let plugin = bootstrap(&daemon_args).await?;
    match plugin.disabled_reason() {
        Some(reason) => tracing::warn!("Accelerator plugin disabled: {reason}"),
        None => {
            let slots = plugin
                .available_slots()
                .await
                .map_err(|e| anyhow::anyhow!("{e:?}"))?;
            tracing::info!(?slots, "Accelerator plugin ready");
        }
    }

    let cancellation_token = CancellationToken::new();
    let (sink, mut records) = mpsc::channel(16);
    let collector = plugin.spawn_collector(cancellation_token.clone(), sink);
    let consumer = tokio::spawn(async move {
        while let Some(cycle) = records.recv().await {
            tracing::debug!(records = cycle.len(), "measurement cycle collected");
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutdown signal received, stopping collector");
    cancellation_token.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = collector.await;
        let _ = consumer.await;
    })
    .await
    .is_err()
    {
        tracing::warn!("Collector did not stop within {SHUTDOWN_TIMEOUT:?}");
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
    Ok(())
}

async fn run_devices(daemon_args: DaemonArgs) -> Result<()> {
    utils::logging::init();

    let plugin = bootstrap(&daemon_args).await?;
    let devices = plugin
        .list_devices()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let slots = plugin
        .available_slots()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let report = serde_json::json!({
        "enabled": plugin.is_enabled(),
        "disabled_reason": plugin.disabled_reason(),
        "devices": devices,
        "slots": slots,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize device report")?
    );
    Ok(())
}

async fn run_runtime_version(daemon_args: DaemonArgs) -> Result<()> {
    utils::logging::init();

    let config = PluginConfig::from(&daemon_args);
    let version = probe_version(&config.helper_binary, config.probe_timeout)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    println!("{version}");
    Ok(())
}
