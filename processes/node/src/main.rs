//! 'main' for the Palisade node process

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use palisade_common::messages::Message;
use std::sync::Arc;
use tracing::info;

use palisade_module_block_manager::BlockManager;
use palisade_module_data_node::DataNodeModule;

use caryatid_module_clock::Clock;
use caryatid_module_spy::Spy;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, EnvFilter, Registry};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Configuration files, later ones override earlier ones
    #[arg(long, value_name = "PATH", default_values_t = vec!["palisade".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());

    // Only turn on span export if some OTEL environment variables exist
    if std::env::vars().any(|(name, _)| name.starts_with("OTEL_")) {
        let otel_exporter = SpanExporter::builder().with_tonic().build()?;
        let otel_tracer = SdkTracerProvider::builder()
            .with_batch_exporter(otel_exporter)
            .build()
            .tracer("palisade-node");
        let otel_layer = OpenTelemetryLayer::new(otel_tracer)
            .with_filter(
                EnvFilter::from_default_env().add_directive(filter::LevelFilter::INFO.into()),
            )
            .with_filter(filter::filter_fn(|meta| meta.is_span()));
        Registry::default().with(fmt_layer).with(otel_layer).init();
    } else {
        Registry::default().with(fmt_layer).init();
    }

    info!("Palisade node process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("PALISADE")).build()?);

    let mut process = Process::<Message>::create(config).await;

    // Modules without a config section stay disabled, so one binary serves
    // both the coordinator and storage nodes
    BlockManager::register(&mut process);
    DataNodeModule::register(&mut process);

    Clock::<Message>::register(&mut process);
    Spy::<Message>::register(&mut process);

    process.run().await?;

    info!("Exiting");

    Ok(())
}
