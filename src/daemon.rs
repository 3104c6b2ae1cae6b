//! Tracing setup and signal-driven shutdown (§4.10, §5).
//!
//! The CLI runs in the foreground only: no process-detach, no PID file, no
//! Unix-socket control channel. What's kept from the daemon-mode tracing
//! setup is the file/OTLP layering itself, since that's ambient
//! infrastructure independent of whether the process backgrounds itself.

use crate::config::LoggingSection;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithHttpConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::PathBuf;
use std::time::Duration;

const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(12);

pub struct LogPaths {
    pub log_dir: PathBuf,
}

impl LogPaths {
    pub fn new(instance_dir: &std::path::Path) -> Self {
        Self {
            log_dir: instance_dir.join("logs"),
        }
    }
}

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

macro_rules! message_truncating_formatter {
    () => {
        format::debug_fn(|writer, field, value| {
            let field_name = field.name();
            if field_name == "message" {
                let formatted = format!("{value:?}");
                const MAX_MESSAGE_CHARS: usize = 280;
                let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
                if was_truncated {
                    write!(writer, "{field_name}={truncated}...")
                } else {
                    write!(writer, "{field_name}={formatted}")
                }
            } else {
                write!(writer, "{field_name}={value:?}")
            }
        })
    };
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Build an OTLP `SdkTracerProvider` when an endpoint is configured. Returns
/// `None` so the OTel layer can be omitted entirely when no endpoint is set.
fn build_otlp_provider(logging: &LoggingSection) -> Option<SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig as _;

    let endpoint = logging.otlp_endpoint.as_deref()?;
    let endpoint = if endpoint.ends_with("/v1/traces") {
        endpoint.to_owned()
    } else {
        format!("{}/v1/traces", endpoint.trim_end_matches('/'))
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|error| eprintln!("failed to build OTLP exporter: {error}"))
        .ok()?;

    let resource = opentelemetry_sdk::Resource::builder().with_service_name("pynchy").build();

    let sampler: opentelemetry_sdk::trace::Sampler = if (logging.sample_rate - 1.0).abs() < f64::EPSILON {
        opentelemetry_sdk::trace::Sampler::AlwaysOn
    } else {
        opentelemetry_sdk::trace::Sampler::ParentBased(Box::new(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            logging.sample_rate,
        )))
    };

    // Async-runtime-aware batch processor: the sync variant panics because
    // reqwest calls tokio::time::sleep internally, which needs an active
    // Tokio runtime on the calling thread.
    let batch_processor = opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .build();

    Some(
        SdkTracerProvider::builder()
            .with_span_processor(batch_processor)
            .with_resource(resource)
            .with_sampler(sampler)
            .build(),
    )
}

/// Initialize terminal + rolling-file logging, with an optional OTLP layer.
/// Returns the `SdkTracerProvider` (call `.shutdown()` on it before exit so
/// the batch exporter flushes) when OTLP export is configured.
pub fn init_tracing(paths: &LogPaths, debug: bool, logging: &LoggingSection) -> Option<SdkTracerProvider> {
    std::fs::create_dir_all(&paths.log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "pynchy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    std::mem::forget(guard);

    let filter = build_env_filter(debug);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(message_truncating_formatter!())
        .compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(message_truncating_formatter!())
        .compact();

    match build_otlp_provider(logging) {
        Some(provider) => {
            let tracer = provider.tracer("pynchy");
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            Some(provider)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
            None
        }
    }
}

/// Wait for SIGINT or SIGTERM. Resolves once, on the first signal received.
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}

/// Drive `shutdown` to completion, forcing the process to exit after
/// [`SHUTDOWN_WATCHDOG`] if it hangs, and immediately on a second signal.
pub async fn shutdown_with_watchdog<F>(shutdown: F)
where
    F: std::future::Future<Output = ()>,
{
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = shutdown => {
            tracing::info!("graceful shutdown completed");
        }
        _ = tokio::time::sleep(SHUTDOWN_WATCHDOG) => {
            tracing::warn!("shutdown watchdog elapsed after {}s, forcing exit", SHUTDOWN_WATCHDOG.as_secs());
            std::process::exit(1);
        }
        _ = sigterm.recv() => {
            tracing::warn!("second SIGTERM received during shutdown, forcing exit");
            std::process::exit(1);
        }
        _ = sigint.recv() => {
            tracing::warn!("second SIGINT received during shutdown, forcing exit");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_handles_multibyte_characters() {
        let message = "abc→def";
        let (truncated, was_truncated) = truncate_for_log(message, 4);
        assert!(was_truncated);
        assert_eq!(truncated, "abc→");
    }

    #[test]
    fn truncate_for_log_returns_original_when_within_limit() {
        let message = "hello";
        let (truncated, was_truncated) = truncate_for_log(message, 10);
        assert!(!was_truncated);
        assert_eq!(truncated, "hello");
    }
}
