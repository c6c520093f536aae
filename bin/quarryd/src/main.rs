//! The quarry runtime daemon.
//!
//! Usage: `quarryd [server_config.yaml]`. An empty argument falls back to
//! the `SERVER_CONF` environment variable, then compiled defaults.

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_default();
    let runtime = match quarry_client::Runtime::start(&config_path) {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "runtime failed to start");
            std::process::exit(1);
        }
    };

    // Ctrl-C behaves like an admin StopRuntime.
    let client_region = runtime.client().region().clone();
    let queues = runtime.client().queues().clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received; stopping runtime");
        let client = quarry_client::Client::from_parts(client_region.clone(), queues.clone());
        if let Err(err) = client.stop_runtime() {
            tracing::error!(%err, "failed to submit stop request");
        }
    })
    .expect("install interrupt handler");

    runtime.wait_for_stop();
    tracing::info!("daemon exit");
}
