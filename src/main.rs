use aws_lambda_events::s3::S3Event;
use clap::Parser;
use http::Response;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use image_thumbnailer::alert::{AlertSink, LogAlertSink, SlackAlertSink, SlackConfig};
use image_thumbnailer::events::ThumbnailEvent;
use image_thumbnailer::init::{self, logging::LoggerGuard};
use image_thumbnailer::store::S3BlobStore;
use image_thumbnailer::thumbnail::{PipelineConfig, ThumbnailPipeline};
use lambda_runtime::Context;
use lambda_runtime::tracing;
use lambda_runtime_api_client::{Client as LambdaClient, body::Body};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tower::BoxError;
use tracing::{error, info, trace, warn};

// Time kept back from the function deadline to post the invocation response
const RESPONSE_RESERVE: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "image-thumbnailer")]
#[command(bin_name = "image-thumbnailer")]
struct Arguments {
    // Parsed earlier by EnvFileArguments, declared so it is not an unknown option
    #[arg(long)]
    env_file: Option<String>,

    #[arg(long, env = "THUMBNAIL_SLACK_TOKEN", hide_env_values = true)]
    /// Slack API token used for failure alerts. Alerts are only logged when unset.
    slack_token: Option<String>,

    #[arg(long, env = "THUMBNAIL_SLACK_CHANNEL", default_value = "#image_resize_fail")]
    /// Slack channel that receives failure alerts
    slack_channel: String,

    #[arg(long, env = "THUMBNAIL_SLACK_HOST", default_value = "slack.com")]
    /// Slack Web API host
    slack_host: String,

    #[arg(long, env = "THUMBNAIL_WATCHDOG_SECS", default_value_t = 39)]
    /// Seconds after which an unfinished invocation sends a timeout alert
    watchdog_secs: u64,

    #[arg(long, env = "THUMBNAIL_MAX_PARALLEL_WIDTHS", default_value_t = 1)]
    /// Maximum number of thumbnail widths rendered at once
    max_parallel_widths: usize,
}

// Minimal option to allow us to parse out the env from a file
#[derive(Debug, Parser)]
#[clap(ignore_errors = true)]
struct EnvFileArguments {
    #[arg(long, env = "THUMBNAIL_ENV_FILE")]
    env_file: Option<String>,
}

fn main() -> ExitCode {
    let start_time = Instant::now();

    let env_opt = EnvFileArguments::parse();
    if let Some(env_file) = env_opt.env_file
        && let Err(e) = init::env::load_file(&env_file)
    {
        eprintln!("Can not load envfile: {}", e);
        return ExitCode::FAILURE;
    }

    let opt = Arguments::parse();

    let guard = match init::logging::setup() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to setup logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run_thumbnailer(start_time, guard, opt) {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Failed to run thumbnailer: {}", e);
            return ExitCode::from(1);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_thumbnailer(
    start_time: Instant,
    log_guard: LoggerGuard,
    opt: Arguments,
) -> Result<(), BoxError> {
    let aws_config = aws_config::load_from_env().await;
    let store = Arc::new(S3BlobStore::new(aws_sdk_s3::Client::new(&aws_config)));

    let alerts: Arc<dyn AlertSink> = match opt.slack_token {
        Some(token) if !token.is_empty() => {
            info!(host = %opt.slack_host, channel = %opt.slack_channel, "Sending alerts to Slack");
            Arc::new(SlackAlertSink::new(SlackConfig {
                host: opt.slack_host,
                token,
                channel: opt.slack_channel,
            })?)
        }
        _ => {
            warn!("THUMBNAIL_SLACK_TOKEN is not set, alerts will only be logged");
            Arc::new(LogAlertSink)
        }
    };

    let pipeline = ThumbnailPipeline::new(
        store,
        alerts,
        PipelineConfig {
            watchdog_budget: Duration::from_secs(opt.watchdog_secs),
            max_parallel_widths: opt.max_parallel_widths,
        },
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Image thumbnailer started in {}ms",
        start_time.elapsed().as_millis()
    );

    let shutdown_hook = || async move {
        std::mem::drop(log_guard);
    };

    // Registers a no-event Lambda extension so we receive shutdown signals
    lambda_runtime::spawn_graceful_shutdown_handler(shutdown_hook).await;

    let lambda_config = Arc::new(lambda_runtime::Config::from_env());
    let lambda_client = LambdaClient::builder().build()?;

    loop {
        trace!("Waiting for next Lambda event");

        let req = lambda_runtime_api_client::build_request()
            .method("GET")
            .uri("/2018-06-01/runtime/invocation/next")
            .body(Body::empty())?;

        let resp = match lambda_client.call(req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!("Error calling Lambda API: {}", e);
                return Err(e);
            }
        };

        handle_lambda_req(
            resp,
            &pipeline,
            &lambda_client,
            lambda_config.clone(),
            opt.watchdog_secs,
        )
        .await?;
    }
}

/// Handle a single invocation from the Lambda runtime API
async fn handle_lambda_req(
    response: Response<Incoming>,
    pipeline: &ThumbnailPipeline,
    client: &LambdaClient,
    config: Arc<lambda_runtime::Config>,
    watchdog_secs: u64,
) -> Result<(), BoxError> {
    let (parts, body) = response.into_parts();

    #[cfg(debug_assertions)]
    if parts.status == http::StatusCode::NO_CONTENT {
        // No events available, continue waiting
        return Ok(());
    }

    let request_id = parts
        .headers
        .get("lambda-runtime-aws-request-id")
        .and_then(|v| v.to_str().ok())
        .ok_or("Missing Lambda request ID")?
        .to_string();

    trace!(request_id = %request_id, "Received Lambda event");

    let body_bytes = body.collect().await?.to_bytes();

    let context = Context::new(&request_id, config.clone(), &parts.headers)?;

    let flush_deadline = match remaining_until_deadline(context.deadline) {
        Some(remaining) => {
            if remaining < Duration::from_secs(watchdog_secs) {
                warn!(
                    request_id = %request_id,
                    remaining_ms = remaining.as_millis() as u64,
                    watchdog_secs,
                    "Function deadline is shorter than the watchdog budget"
                );
            }
            Instant::now() + remaining.saturating_sub(RESPONSE_RESERVE)
        }
        None => {
            error!(request_id = %request_id, context.deadline, "Deadline already exceeded");
            return send_error_response(
                client,
                &request_id,
                "DeadlineExceeded",
                "Deadline already exceeded, increase Lambda deadline",
            )
            .await;
        }
    };

    let payload: S3Event = match serde_json::from_slice(&body_bytes) {
        Ok(e) => e,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to deserialize event");
            return send_error_response(
                client,
                &request_id,
                "DeserializationError",
                &format!("Failed to deserialize event: {}", e),
            )
            .await;
        }
    };

    let result = pipeline
        .handle_event(ThumbnailEvent::new(payload, context))
        .await;

    // The environment is frozen once the response is posted, so alerts still
    // in flight must complete first
    pipeline
        .flush_alerts(flush_deadline.saturating_duration_since(Instant::now()))
        .await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Invalid S3 event");
            return send_error_response(client, &request_id, "InvalidEvent", &e.to_string())
                .await;
        }
    };

    let response_body = serde_json::json!({
        "stored": report.stored_count(),
        "failed": report.failed_count(),
        "timedOut": report.timed_out,
    });

    send_success_response(client, &request_id, &response_body).await
}

/// Send a success response to the Lambda runtime API
async fn send_success_response(
    client: &LambdaClient,
    request_id: &str,
    response_body: &serde_json::Value,
) -> Result<(), BoxError> {
    let response_bytes = serde_json::to_vec(response_body)?;

    let req = lambda_runtime_api_client::build_request()
        .method("POST")
        .uri(format!(
            "/2018-06-01/runtime/invocation/{}/response",
            request_id
        ))
        .header("content-type", "application/json")
        .body(Body::from(response_bytes))?;

    client.call(req).await?;
    Ok(())
}

/// Send an error response to the Lambda runtime API
async fn send_error_response(
    client: &LambdaClient,
    request_id: &str,
    error_type: &str,
    error_message: &str,
) -> Result<(), BoxError> {
    let diagnostic = lambda_runtime::Diagnostic {
        error_type: error_type.to_string(),
        error_message: error_message.to_string(),
    };
    let error_body = serde_json::to_vec(&diagnostic)?;

    let req = lambda_runtime_api_client::build_request()
        .method("POST")
        .uri(format!(
            "/2018-06-01/runtime/invocation/{}/error",
            request_id
        ))
        .header("content-type", "application/json")
        .header("lambda-runtime-function-error-type", "unhandled")
        .body(Body::from(error_body))?;

    client.call(req).await?;
    Ok(())
}

/// Time left until the Lambda deadline (epoch milliseconds).
/// Returns None if the deadline has passed.
fn remaining_until_deadline(deadline_ms: u64) -> Option<Duration> {
    let deadline = UNIX_EPOCH + Duration::from_millis(deadline_ms);
    deadline.duration_since(SystemTime::now()).ok()
}
