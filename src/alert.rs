use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio_util::task::TaskTracker;
use tower::BoxError;
use tracing::{debug, warn};

use crate::init_crypto;

/// Characters left as-is in query parameter values
const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const POST_MESSAGE_PATH: &str = "/api/chat.postMessage";

/// Destination for operational alerts.
///
/// `notify` must not block and callers never learn whether the alert
/// arrived. Deliveries run in the background; `flush` waits for the ones
/// still in flight so they are not frozen with the execution environment
/// once the invocation response is sent.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn notify(&self, text: &str);

    async fn flush(&self) {}
}

/// Background deliveries that have not completed yet
#[derive(Debug, Default, Clone)]
pub struct PendingDeliveries {
    tracker: TaskTracker,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(delivery);
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every delivery spawned so far. Deliveries spawned while
    /// waiting are waited for too.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Connection settings for the Slack Web API
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub host: String,
    pub token: String,
    pub channel: String,
}

/// Posts alerts to a Slack channel with `chat.postMessage`
pub struct SlackAlertSink {
    config: SlackConfig,
    client: HyperClient<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    deliveries: PendingDeliveries,
}

impl SlackAlertSink {
    pub fn new(config: SlackConfig) -> Result<Self, BoxError> {
        init_crypto();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_only()
            .enable_http1()
            .enable_http2()
            .build();
        let client = HyperClient::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            config,
            client,
            deliveries: PendingDeliveries::new(),
        })
    }

    fn request_uri(&self, text: &str) -> String {
        post_message_uri(&self.config, text)
    }
}

#[async_trait]
impl AlertSink for SlackAlertSink {
    fn notify(&self, text: &str) {
        let uri: hyper::Uri = match self.request_uri(text).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "Unable to build alert request URI");
                return;
            }
        };

        let req = match hyper::Request::builder()
            .uri(uri)
            .method("GET")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Unable to build alert request");
                return;
            }
        };

        let client = self.client.clone();
        self.deliveries.spawn(async move {
            match client.request(req).await {
                Ok(response) => {
                    let status = response.status();
                    // Drain so the connection can be reused; the content is ignored
                    let _ = response.into_body().collect().await;
                    debug!(status = %status, "Alert delivered");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to deliver alert");
                }
            }
        });
    }

    async fn flush(&self) {
        if !self.deliveries.is_empty() {
            debug!(pending = self.deliveries.len(), "Waiting for alert deliveries");
        }
        self.deliveries.wait().await;
    }
}

/// Used when no Slack token is configured
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn notify(&self, text: &str) {
        warn!(alert = %text, "No alert channel configured, alert not delivered");
    }
}

fn post_message_uri(config: &SlackConfig, text: &str) -> String {
    format!(
        "https://{}{}?token={}&channel={}&text={}&pretty=1",
        config.host,
        POST_MESSAGE_PATH,
        utf8_percent_encode(&config.token, QUERY_SET),
        utf8_percent_encode(&config.channel, QUERY_SET),
        utf8_percent_encode(text, QUERY_SET),
    )
}

/// Append the wall clock time as `-H<h>/M<m>/S<s>`
pub fn with_clock_suffix(text: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-H{}/M{}/S{}",
        text,
        now.hour(),
        now.minute(),
        now.second()
    )
}
