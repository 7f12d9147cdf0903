use std::{process, sync::OnceLock};

use speedbee::{config::Config, core::service::Service, logger::LoggerManager, print_error};
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Resolves on Ctrl+C, or SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[tokio::main]
async fn main() {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    info!("Starting speedbee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    info!(
        "Broker {}:{}, sensor prefix {}, command topic {}",
        cfg.transport.host,
        cfg.transport.port,
        cfg.homeassistant.sensor_prefix,
        cfg.homeassistant.command_topic
    );
    debug!("{:#?}", cfg.speedtest);
    debug!("{:#?}", cfg.schedule);

    let service = Service::from_config(cfg).unwrap_or_else(|e| {
        error!("Failed to create service: {}", e);
        process::exit(1);
    });

    if cfg.schedule.test_mode {
        info!("Test mode: running a single measurement");
        let outcome = service.run_once().await;
        info!("Test run finished: {:?}", outcome);
        return;
    }

    let cancel = service.cancel_token();
    let running = tokio::spawn(service.run());

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = running.await {
        error!("Service task failed: {}", e);
        process::exit(1);
    }
}
