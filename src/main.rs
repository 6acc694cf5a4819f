use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafdesk::cluster::factory_for;
use kafdesk::config::Config;
use kafdesk::{server, KafdeskEngine};

// ========================================
// MAIN ENTRY POINT
// ========================================

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let filter = EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("[Main] Kafdesk v{} starting ({:?} backend)", env!("CARGO_PKG_VERSION"), config.backend);

    let engine = match factory_for(config.backend).and_then(|factory| KafdeskEngine::new(&config, factory)) {
        Ok(engine) => engine,
        Err(e) => {
            error!("[Main] Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[Main] Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("[Main] Ctrl-C received");
    };

    if let Err(e) = server::serve(engine.clone(), &config.server, shutdown).await {
        error!("[Main] Server stopped: {}", e);
    }

    engine.shutdown().await;
    info!("[Main] Bye");
}
