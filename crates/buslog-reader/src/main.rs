// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use buslog::{
    bus::BusConnector, config::BuslogConfig, errors::ConfigError, pubsub::PubSubConnector,
    reader::follow_topic, reorder::LineSink,
};

const USAGE: &str = "Usage: buslog-reader <topic>";

#[tokio::main]
pub async fn main() {
    let Some(topic) = env::args().nth(1) else {
        eprintln!("{USAGE}");
        process::exit(1);
    };

    let config = BuslogConfig::from_env();
    init_tracing(&filter_directives(&config));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let connector = PubSubConnector::new(&config.pubsub_endpoint);
    let bus = match connector.connect(&config.project_id).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let sink = LineSink::new(std::io::stdout());
    let reader = match follow_topic(bus.as_ref(), &topic, config.reorder_config(), sink).await {
        Ok(reader) => reader,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    info!("Shutting down reader for topic {topic}");

    if let Err(e) = reader.shutdown().await {
        error!("Reader shutdown incomplete: {e}");
    }
}

/// An invalid configuration is reported at the default level.
fn filter_directives(config: &Result<BuslogConfig, ConfigError>) -> String {
    let log_level = config.as_ref().map_or("info", |config| config.log_level.as_str());
    format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}")
}

fn init_tracing(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries records only.
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for SIGINT: {e}");
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for SIGINT: {e}");
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {e}");
    }
}
