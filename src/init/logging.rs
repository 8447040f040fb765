use std::env;

use tower::BoxError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, filter::LevelFilter};

pub type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

// Chatty at info; only quieted when the filter does not mention them
const QUIET_TARGETS: &[&str] = &["aws_config", "aws_smithy_runtime", "hyper_util", "rustls"];

/// Log line format, following the function's Lambda logging configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Level used for targets the filter directives do not name.
///
/// Lambda's `AWS_LAMBDA_LOG_LEVEL` has a `FATAL` level tracing lacks; it
/// maps to error.
fn default_level(value: Option<&str>) -> LevelFilter {
    match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
        Some("TRACE") => LevelFilter::TRACE,
        Some("DEBUG") => LevelFilter::DEBUG,
        Some("WARN") => LevelFilter::WARN,
        Some("ERROR") | Some("FATAL") => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn build_filter(directives: &str, level: LevelFilter) -> Result<EnvFilter, BoxError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse(directives)?;

    for target in QUIET_TARGETS {
        if !directives.contains(target) {
            filter = filter.add_directive(format!("{}=warn", target).parse()?);
        }
    }

    Ok(filter)
}

pub fn setup() -> Result<LoggerGuard, BoxError> {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let level = default_level(env::var("AWS_LAMBDA_LOG_LEVEL").ok().as_deref());
    let filter = build_filter(&directives, level)?;

    let format = LogFormat::from_value(env::var("AWS_LAMBDA_LOG_FORMAT").ok().as_deref());

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_target(false)
        // cloudwatch will add time
        .without_time()
        // cloudwatch doesn't play nice with escape codes
        .with_ansi(false);

    match format {
        LogFormat::Json => {
            let subscriber = Registry::default().with(filter).with(layer.json());
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let subscriber = Registry::default().with(filter).with(layer.compact());
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(guard)
}
