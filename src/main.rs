pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod retry;
pub mod scheduler;
pub mod session;

use crate::bridge::{command_queue, remembered_state, CommandBridge, RebootLatch};
use crate::config::BridgeConfig;
use crate::mqtt::config::TopicLayout;
use crate::mqtt::message_manager::StatePublisher;
use crate::mqtt::mqtt_handler::{ConnectionState, MqttHandler};
use crate::scheduler::{LoopExit, LoopWiring, PollLoop};
use crate::session::{CapabilityMap, WebSocketConnector};
use color_eyre::Result;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    setup()?;

    let config_path = BridgeConfig::resolve_path(std::env::args().nth(1));
    let config = BridgeConfig::load(&config_path).await?;
    info!(
        "Starting solmate-bridge {} for {}",
        env!("CARGO_PKG_VERSION"),
        config.device.server_uri
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let (command_tx, command_rx) = command_queue();
    let (remembered_writer, remembered_reader) = remembered_state();
    let (capabilities_tx, capabilities_rx) = watch::channel(CapabilityMap::default());
    let reboot = RebootLatch::default();

    // Bus: own task, own retry track
    let bus_stop = CancellationToken::new();
    let mut bus = None;
    let publisher: Option<Arc<dyn StatePublisher>> =
        if config.mqtt.enabled && !config.general.api_info {
            let (handler, publisher, status) = MqttHandler::new(&config.mqtt, &config.timers);
            let bridge = CommandBridge::new(
                TopicLayout::new(&config.mqtt),
                config.limits.clone(),
                remembered_reader,
                capabilities_rx,
                reboot.clone(),
                command_tx,
                publisher.clone(),
            );
            let handle = tokio::spawn(handler.run(bridge, bus_stop.clone(), cancel.clone()));
            bus = Some((handle, status));
            Some(publisher)
        } else {
            info!("MQTT disabled, reading the device only");
            None
        };

    let poll = PollLoop::new(
        config,
        Arc::new(WebSocketConnector),
        LoopWiring {
            queue: command_rx,
            remembered: remembered_writer,
            capabilities: capabilities_tx,
            reboot,
            publisher,
        },
        cancel.clone(),
    )?;
    let outcome = poll.run().await;

    // Runs on every exit path of the poll loop
    bus_stop.cancel();
    let mut bus_rejected = false;
    if let Some((handle, status)) = bus {
        if let Err(e) = handle.await {
            warn!("MQTT task ended abnormally: {}", e);
        }
        let status = status.borrow();
        info!(
            "MQTT: {} messages received, last at {}",
            status.messages_received,
            status
                .last_activity
                .as_ref()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".into())
        );
        if let Some(e) = &status.last_error {
            info!("MQTT: last error: {}", e);
        }
        bus_rejected = status.connection_state == ConnectionState::Failed;
    }

    match outcome {
        Ok(_) if bus_rejected => {
            error!("Exiting: MQTT broker rejected the credentials");
            Ok(ExitCode::FAILURE)
        }
        Ok(LoopExit::ApiInfoDumped) => Ok(ExitCode::SUCCESS),
        Ok(LoopExit::Shutdown) => {
            info!("Shut down cleanly");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Exiting: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
                        _ = term.recv() => info!("SIGTERM received"),
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Interrupt received");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received");
        }
        cancel.cancel();
    });
}
