use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ecpay_gateway::pos::mock::MockTransport;
use ecpay_gateway::pos::Scanner;
use ecpay_gateway::{Config, ControlServer, TransactionEngine};

fn main() {
    let config = Config::parse();

    // Structured logging: console always, daily-rolling file when a log
    // directory is configured. The appender guard must outlive main.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ecpay_gateway=debug"));
    let console_layer = fmt::layer().with_target(true);

    let _guard = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let appender = tracing_appender::rolling::daily(dir, "ecpay-gateway");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "ECPay POS gateway starting");

    let engine = Arc::new(TransactionEngine::new(config.baud));

    // Attach a terminal: an explicit endpoint or the simulated terminal
    // binds directly; otherwise the scanner owns discovery.
    if config.mock {
        info!("Mock mode: attaching in-process simulated terminal");
        engine.install_transport(Box::new(MockTransport::new()));
    } else if let Some(endpoint) = &config.endpoint {
        if !engine.connect_to(endpoint) {
            warn!(endpoint = %endpoint, "Configured endpoint unavailable, commands will fail until it comes up");
        }
    } else {
        info!("No endpoint configured, enabling auto-detection");
        let scanner = Scanner::new(engine.clone(), config.baud);
        engine.set_rescan_handle(scanner.spawn());
    }

    let server = ControlServer::new(engine);
    server.clone().start_status_broadcast();
    if let Err(e) = server.serve(&config.bind) {
        eprintln!("ecpay-gateway: {e}");
        std::process::exit(1);
    }
}
