use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::Resource;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level, Metadata, Subscriber};
use tracing_core::callsite;
use tracing_core::metadata::ParseLevelError;
use tracing_subscriber::filter::{FilterFn, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, Filter, Layer, SubscriberExt};

/// The environment variable that overrides [`Options::default_log_level`].
pub const LOG_LEVEL_ENV: &str = "LOGLEVEL";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to parse LOGLEVEL={value:?}: {source}")]
    InvalidLogLevel {
        value: String,
        source: ParseLevelError,
    },

    #[error("failed to install OpenTelemetry error handler: {0}")]
    ErrorHandler(#[from] opentelemetry::global::Error),

    #[error("failed to install OTLP trace exporter: {0}")]
    Exporter(#[from] opentelemetry::trace::TraceError),

    #[error("failed to set global tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

// Counts repeated events per key within a reporting interval.
struct SpewTracker<K> {
    spewers: Mutex<HashMap<K, Spew>>,
    interval: Duration,
}

struct Spew {
    count: usize,
    started: Instant,
}

impl Spew {
    fn new(started: Instant) -> Spew {
        Spew { count: 0, started }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Admit {
    Yes,
    /// Yes, and this many duplicates were dropped since the last one let
    /// through.
    AfterSuppressing(usize),
    No,
}

impl<K: Hash + Eq> SpewTracker<K> {
    fn new(interval: Duration) -> Self {
        Self {
            spewers: Mutex::new(HashMap::new()),
            interval,
        }
    }

    fn admit(&self, key: K, now: Instant) -> Admit {
        let mut spewers = self.spewers.lock().unwrap();
        match spewers.entry(key) {
            Entry::Occupied(mut e) => {
                let spew = e.get_mut();
                if now.saturating_duration_since(spew.started) < self.interval {
                    spew.count += 1;
                    Admit::No
                } else {
                    let suppressed = spew.count;
                    *spew = Spew::new(now);
                    if suppressed > 0 {
                        Admit::AfterSuppressing(suppressed)
                    } else {
                        Admit::Yes
                    }
                }
            }
            Entry::Vacant(v) => {
                v.insert(Spew::new(now));
                Admit::Yes
            }
        }
    }
}

/// Lets through at most one warning or error per callsite per interval.
///
/// A retry storm logs a warning for every failed attempt, which would
/// otherwise drown out everything else.
struct SpewFilter(SpewTracker<callsite::Identifier>);

impl<S: Subscriber> Filter<S> for SpewFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        // Higher levels are more verbose, leave INFO, DEBUG & TRACE logging alone.
        if *meta.level() > Level::WARN || meta.fields().field("suppressed").is_some() {
            return true;
        }
        match self.0.admit(meta.callsite(), Instant::now()) {
            Admit::Yes => true,
            Admit::No => false,
            Admit::AfterSuppressing(suppressed) => {
                warn!(
                    suppressed,
                    "suppressed duplicate log entries from {}",
                    meta.name()
                );
                true
            }
        }
    }
}

// Quiet down some libs.
fn should_log(module_path: Option<&str>) -> bool {
    if let Some(module) = module_path {
        let module = module.split_once("::").map(|(l, _)| l).unwrap_or(module);
        if matches!(
            module,
            "h2" | "hyper" | "mio" | "rustls" | "tokio_util" | "tonic" | "tower" | "want"
        ) {
            return false;
        }
    }
    true
}

pub fn configure(service_name: &str) -> Result<(), LoggingError> {
    configure_with_options(Options {
        process_name: service_name.to_owned(),
        ..Options::default()
    })
}

pub struct Options {
    pub process_name: String,
    /// Used when [`LOG_LEVEL_ENV`] isn't set.
    pub default_log_level: Level,
    /// Added to the OpenTelemetry resource of every exported span.
    pub additional_tags: HashMap<String, String>,
    pub trace_sampler: Sampler,
    /// Where to export spans over OTLP/gRPC. `None` disables span export.
    pub otlp_endpoint: Option<String>,
    /// How long duplicate warnings from one callsite are suppressed for.
    pub spew_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            default_log_level: Level::INFO,
            additional_tags: HashMap::new(),
            trace_sampler: Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(0.1))),
            otlp_endpoint: Some(String::from("http://localhost:4317")),
            spew_interval: Duration::from_secs(1),
        }
    }
}

fn log_level(default: Level) -> Result<Level, LoggingError> {
    match std::env::var(LOG_LEVEL_ENV) {
        Ok(value) => Level::from_str(&value)
            .map_err(|source| LoggingError::InvalidLogLevel { value, source }),
        Err(_) => Ok(default),
    }
}

/// Installs the global `tracing` subscriber. Must be called from within a
/// tokio runtime when span export is enabled.
pub fn configure_with_options(options: Options) -> Result<(), LoggingError> {
    let log_level = log_level(options.default_log_level)?;

    let telemetry = match &options.otlp_endpoint {
        Some(endpoint) => {
            // By default, opentelemetry spews pretty often to stderr when it
            // can't find a server to submit traces to. This quiets down the
            // errors and sends them to the logger.
            opentelemetry::global::set_error_handler(|e| {
                use opentelemetry::global::Error;
                use opentelemetry::trace::TraceError;
                match e {
                    Error::Trace(TraceError::ExportFailed(_))
                    | Error::Trace(TraceError::ExportTimedOut(_)) => {
                        // These errors are unlikely to cause infinite cycles with logging.
                        warn!(error = %e, "opentelemetry error");
                    }
                    _ => {
                        // This goes to stderr so that it's not an infinite cycle with logging.
                        eprintln!("opentelemetry error: {e}");
                    }
                }
            })?;

            let mut resource_properties =
                vec![KeyValue::new("service.name", options.process_name.clone())];
            for (k, v) in &options.additional_tags {
                resource_properties.push(KeyValue::new(k.clone(), v.clone()));
            }

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_sampler(options.trace_sampler)
                        .with_resource(Resource::new(resource_properties)),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;

            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let terminal = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ACTIVE)
        .with_target(false);

    let terminal = if std::io::stdout().is_terminal() {
        terminal.boxed()
    } else {
        terminal.json().boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            terminal
                .with_filter(SpewFilter(SpewTracker::new(options.spew_interval)))
                .with_filter(LevelFilter::from_level(log_level)),
        )
        .with(telemetry)
        .with(FilterFn::new(|metadata| should_log(metadata.module_path())));

    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        max_level = %log_level,
        process = options.process_name,
        otlp = options.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "initialized logging. you can set verbosity with env var LOGLEVEL."
    );
    Ok(())
}

/// Exports any buffered spans. Call this before the process exits.
pub fn flush() {
    opentelemetry::global::shutdown_tracer_provider()
}
