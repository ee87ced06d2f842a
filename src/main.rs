use std::process;
use strata::config::StreamerConfig;
use strata::logger::{log, LogSeverity::*};
use strata::server;

#[tokio::main]
async fn main() {
    log("Strata init".to_string(), Info);
    let config = match std::env::args().nth(1) {
        Some(path) => StreamerConfig::load(&path),
        None => Ok(StreamerConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log(format!("Failed to load configuration: {}", e), Fatal);
            process::exit(1);
        }
    };
    if let Err(e) = server::run(config).await {
        log(format!("Server stopped: {}", e), Fatal);
        process::exit(1);
    }
}
