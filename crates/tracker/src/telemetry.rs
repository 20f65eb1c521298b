use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::TrackerConfig;

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &TrackerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

pub fn setup_tracing(config: &TrackerConfig) -> Result<()> {
    let env_filter_layer = get_env_filter();
    let log_layer = get_log_layer(config).with_filter(env_filter_layer);
    let subscriber = tracing_subscriber::Registry::default().with(log_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Install the global OTLP meter provider when metrics are enabled. A no-op
/// otherwise: instruments built from the global meter then never record.
pub fn init_metrics(config: &TrackerConfig) -> Result<()> {
    if !config.telemetry.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_service_name("mesos-tracker")
        .with_attribute(KeyValue::new("tracker.instance.id", config.instance_id()))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.telemetry.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}
