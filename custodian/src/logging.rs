//! Tracing setup driven by the logging config.
//!
//! `RUST_LOG` wins over the configured level so operators can turn on debug
//! output without editing config.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::io::config::Logging;

pub fn init(cfg: &Logging) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("invalid log level {:?}", cfg.level))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match cfg.format.as_str() {
        "json" => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        _ => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    });

    if !cfg.file.is_empty() {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&cfg.file)
            .with_context(|| format!("open log file {:?}", cfg.file))?;
        layers.push(fmt::layer().with_ansi(false).with_writer(Arc::new(file)).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
    Ok(())
}
