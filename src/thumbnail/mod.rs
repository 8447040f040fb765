use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, warn};

use crate::alert::AlertSink;
use crate::events::{EventError, SourceObject, ThumbnailEvent};
use crate::naming::DerivedNaming;
use crate::plan::ResizePlan;
use crate::store::BlobStore;
use crate::watchdog::{self, Watchdog};

mod resize;
mod width_task;

pub use resize::{Dimensions, Thumbnail, render_thumbnail, target_dimensions};
use width_task::WidthTask;

/// Errors for a single thumbnail width
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("store failed: {0}")]
    Store(String),
}

/// Configuration for the thumbnail pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Time after which the watchdog sends a timeout alert
    pub watchdog_budget: Duration,
    /// Maximum number of widths processed at once
    pub max_parallel_widths: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watchdog_budget: watchdog::DEFAULT_BUDGET,
            max_parallel_widths: 1,
        }
    }
}

/// What happened to one planned width
#[derive(Debug)]
pub enum ResizeOutcome {
    Stored {
        width: u32,
        key: String,
        dimensions: Dimensions,
    },
    Failed {
        width: u32,
        key: String,
        error: ThumbnailError,
    },
}

impl ResizeOutcome {
    pub fn width(&self) -> u32 {
        match self {
            ResizeOutcome::Stored { width, .. } | ResizeOutcome::Failed { width, .. } => *width,
        }
    }

    /// Destination key of the thumbnail
    pub fn key(&self) -> &str {
        match self {
            ResizeOutcome::Stored { key, .. } | ResizeOutcome::Failed { key, .. } => key,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, ResizeOutcome::Stored { .. })
    }
}

/// Result of one invocation, outcomes in plan order
#[derive(Debug)]
pub struct PipelineReport {
    pub source: SourceObject,
    pub outcomes: Vec<ResizeOutcome>,
    /// Whether the watchdog sent a timeout alert
    pub timed_out: bool,
}

impl PipelineReport {
    pub fn stored_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_stored()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.stored_count()
    }
}

/// Writes resized copies of an uploaded image next to the original
pub struct ThumbnailPipeline {
    store: Arc<dyn BlobStore>,
    alerts: Arc<dyn AlertSink>,
    config: PipelineConfig,
}

impl ThumbnailPipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        alerts: Arc<dyn AlertSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            config,
        }
    }

    /// Run the pipeline for the object named in an S3 notification
    pub async fn handle_event(&self, event: ThumbnailEvent) -> Result<PipelineReport, EventError> {
        info!(
            request_id = %event.context.request_id,
            records_count = event.payload.records.len(),
            "Handling S3 event notification"
        );

        let source = SourceObject::from_event(&event.payload)?;
        Ok(self.run(source).await)
    }

    /// Produce every planned thumbnail for `source`.
    ///
    /// Never fails: per-width errors are alerted and recorded in the report.
    pub async fn run(&self, source: SourceObject) -> PipelineReport {
        let naming = DerivedNaming::resolve(&source.key);

        info!(
            bucket = %source.bucket,
            key = %source.key,
            file_name = %naming.file_name,
            key_prefix = %naming.key_prefix,
            content_type = %naming.content_type(),
            "Resolved thumbnail naming"
        );

        let plan = ResizePlan::for_bucket(&source.bucket);
        let limit = self.config.max_parallel_widths.clamp(1, plan.len().max(1));

        info!(widths = ?plan.widths(), concurrency = limit, "Planned thumbnail widths");

        let watchdog = Watchdog::arm(self.config.watchdog_budget, self.alerts.clone(), &source);

        // `buffered` keeps the plan order; with a limit of one the widths run
        // strictly one after another
        let outcomes: Vec<ResizeOutcome> = stream::iter(plan.widths().iter().copied().enumerate())
            .map(|(index, width)| {
                WidthTask::new(
                    index,
                    width,
                    &source,
                    &naming,
                    self.store.as_ref(),
                    self.alerts.as_ref(),
                )
                .process()
            })
            .buffered(limit)
            .collect()
            .await;

        let timed_out = watchdog.disarm();

        let report = PipelineReport {
            source,
            outcomes,
            timed_out,
        };

        info!(
            stored = report.stored_count(),
            failed = report.failed_count(),
            timed_out = report.timed_out,
            "All thumbnail widths done"
        );

        report
    }

    /// Wait up to `limit` for alerts still being delivered.
    ///
    /// Returns false when the limit ran out first; those alerts may be lost.
    pub async fn flush_alerts(&self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.alerts.flush()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    limit_ms = limit.as_millis() as u64,
                    "Alert deliveries still pending at the invocation deadline"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::{GenericImageView, ImageFormat};

    use super::resize::test_images::solid;
    use super::*;
    use crate::alert::PendingDeliveries;
    use crate::alert::recording::RecordingAlertSink;
    use crate::store::memory::MemoryBlobStore;
    use crate::store::{StoreError, StoredObject};

    fn pipeline(
        store: Arc<dyn BlobStore>,
        alerts: Arc<RecordingAlertSink>,
        config: PipelineConfig,
    ) -> ThumbnailPipeline {
        ThumbnailPipeline::new(store, alerts, config)
    }

    fn stored_dimensions(store: &MemoryBlobStore, bucket: &str, key: &str) -> (u32, u32) {
        let object = store
            .object(bucket, key)
            .unwrap_or_else(|| panic!("missing {}/{}", bucket, key));
        image::load_from_memory(&object.body).unwrap().dimensions()
    }

    #[tokio::test]
    async fn test_handle_event() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "folder/my photo_image_png_0",
            solid(800, 400, ImageFormat::Png),
            Some("image/png"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());
        let pipeline = pipeline(store.clone(), alerts, PipelineConfig::default());

        let payload: aws_lambda_events::s3::S3Event = serde_json::from_value(serde_json::json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "eventTime": "2024-01-01T00:00:00.000Z",
                "userIdentity": { "principalId": "EXAMPLE" },
                "requestParameters": { "sourceIPAddress": "127.0.0.1" },
                "responseElements": {},
                "s3": {
                    "bucket": { "name": "photos", "ownerIdentity": { "principalId": "EXAMPLE" } },
                    "object": { "key": "folder/my+photo_image_png_0", "size": 10 }
                }
            }]
        }))
        .unwrap();

        let event = ThumbnailEvent::new(payload, lambda_runtime::Context::default());
        let report = pipeline.handle_event(event).await.unwrap();

        assert_eq!(report.source.key, "folder/my photo_image_png_0");
        assert_eq!(report.stored_count(), 2);
        assert_eq!(
            stored_dimensions(&store, "photos", "folder/my photo_image_png_0_400"),
            (400, 200)
        );
    }

    #[tokio::test]
    async fn test_handle_event_without_records() {
        let pipeline = pipeline(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(RecordingAlertSink::new()),
            PipelineConfig::default(),
        );
        let payload = aws_lambda_events::s3::S3Event::default();
        let event = ThumbnailEvent::new(payload, lambda_runtime::Context::default());

        assert!(matches!(
            pipeline.handle_event(event).await,
            Err(EventError::NoRecords)
        ));
    }

    #[tokio::test]
    async fn test_default_bucket_writes_both_widths() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "folder/photo_image_jpg",
            solid(2000, 1000, ImageFormat::Jpeg),
            Some("image/jpeg"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("photos", "folder/photo_image_jpg"))
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.stored_count(), 2);
        assert!(!report.timed_out);
        assert_eq!(report.outcomes[0].key(), "folder/photo_image_jpg_400");
        assert_eq!(report.outcomes[1].key(), "folder/photo_image_jpg_1024");

        assert_eq!(
            stored_dimensions(&store, "photos", "folder/photo_image_jpg_400"),
            (400, 200)
        );
        assert_eq!(
            stored_dimensions(&store, "photos", "folder/photo_image_jpg_1024"),
            (1024, 512)
        );

        let thumb = store.object("photos", "folder/photo_image_jpg_400").unwrap();
        assert_eq!(thumb.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(image::guess_format(&thumb.body).unwrap(), ImageFormat::Jpeg);

        assert!(alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_email_bucket_writes_small_width_only() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "email-attachments",
            "folder/photo_image_jpg",
            solid(900, 600, ImageFormat::Jpeg),
            Some("image/jpeg"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("email-attachments", "folder/photo_image_jpg"))
            .await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].width(), 400);
        assert!(store.object("email-attachments", "folder/photo_image_jpg_400").is_some());
        assert!(store.object("email-attachments", "folder/photo_image_jpg_1024").is_none());
    }

    #[tokio::test]
    async fn test_small_image_is_not_upscaled() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "a/small_image_png_0",
            solid(300, 180, ImageFormat::Png),
            Some("image/png"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts, PipelineConfig::default())
            .run(SourceObject::new("photos", "a/small_image_png_0"))
            .await;

        assert_eq!(report.stored_count(), 2);
        for outcome in &report.outcomes {
            match outcome {
                ResizeOutcome::Stored { dimensions, .. } => {
                    assert_eq!(*dimensions, Dimensions::new(300, 180));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(
            stored_dimensions(&store, "photos", "a/small_image_png_0_1024"),
            (300, 180)
        );
    }

    #[tokio::test]
    async fn test_upload_uses_fetched_content_type() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "a/b_image_x-ms-bmp_0",
            solid(800, 800, ImageFormat::Bmp),
            Some("image/x-ms-bmp"),
        );
        store.insert(
            "photos",
            "a/c_image_png_0",
            solid(800, 800, ImageFormat::Png),
            None,
        );
        let alerts = Arc::new(RecordingAlertSink::new());
        let pipeline = pipeline(store.clone(), alerts, PipelineConfig::default());

        pipeline
            .run(SourceObject::new("photos", "a/b_image_x-ms-bmp_0"))
            .await;
        let thumb = store.object("photos", "a/b_image_x-ms-bmp_0_400").unwrap();
        assert_eq!(thumb.content_type.as_deref(), Some("image/x-ms-bmp"));
        assert_eq!(image::guess_format(&thumb.body).unwrap(), ImageFormat::Bmp);

        // Without a declared type the derived one is used
        pipeline.run(SourceObject::new("photos", "a/c_image_png_0")).await;
        let thumb = store.object("photos", "a/c_image_png_0_400").unwrap();
        assert_eq!(thumb.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_failed_store_does_not_stop_other_widths() {
        let store = Arc::new(MemoryBlobStore::new().fail_put("folder/photo_image_png_0_400"));
        store.insert(
            "photos",
            "folder/photo_image_png_0",
            solid(1200, 600, ImageFormat::Png),
            Some("image/png"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("photos", "folder/photo_image_png_0"))
            .await;

        assert!(matches!(
            &report.outcomes[0],
            ResizeOutcome::Failed { error: ThumbnailError::Store(_), .. }
        ));
        assert!(report.outcomes[1].is_stored());
        assert_eq!(
            stored_dimensions(&store, "photos", "folder/photo_image_png_0_1024"),
            (1024, 512)
        );

        let alerts = alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with(
            "Unable to resize photos/folder/photo_image_png_0 and upload to photos/folder/photo_image_png_0_400 due to an error: store failed"
        ));
        assert!(alerts[0].contains("-H"));
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_stop_other_widths() {
        let store = Arc::new(MemoryBlobStore::new().fail_next_gets(1));
        store.insert(
            "photos",
            "p_image_png_0",
            solid(1200, 600, ImageFormat::Png),
            Some("image/png"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("photos", "p_image_png_0"))
            .await;

        assert!(matches!(
            &report.outcomes[0],
            ResizeOutcome::Failed { error: ThumbnailError::Fetch(_), .. }
        ));
        assert!(report.outcomes[1].is_stored());
        assert_eq!(alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_image_fails_every_width() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "p_image_jpeg_0",
            b"not an image".to_vec(),
            Some("image/jpeg"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store.clone(), alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("photos", "p_image_jpeg_0"))
            .await;

        assert_eq!(report.failed_count(), 2);
        assert!(report.outcomes.iter().all(|o| matches!(
            o,
            ResizeOutcome::Failed { error: ThumbnailError::Decode(_), .. }
        )));
        assert_eq!(alerts.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_widths_keep_plan_order() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            "photos",
            "p_image_png_0",
            solid(1600, 1200, ImageFormat::Png),
            Some("image/png"),
        );
        let alerts = Arc::new(RecordingAlertSink::new());
        let config = PipelineConfig {
            max_parallel_widths: 4,
            ..Default::default()
        };

        let report = pipeline(store.clone(), alerts, config)
            .run(SourceObject::new("photos", "p_image_png_0"))
            .await;

        let widths: Vec<u32> = report.outcomes.iter().map(|o| o.width()).collect();
        assert_eq!(widths, vec![400, 1024]);
        assert_eq!(report.stored_count(), 2);
    }

    /// Delays every read before delegating
    struct SlowBlobStore {
        inner: MemoryBlobStore,
        delay: Duration,
    }

    #[async_trait]
    impl BlobStore for SlowBlobStore {
        async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(bucket, key).await
        }

        async fn put(
            &self,
            bucket: &str,
            key: &str,
            body: Bytes,
            content_type: &str,
        ) -> Result<(), StoreError> {
            self.inner.put(bucket, key, body, content_type).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_run_sends_one_timeout_alert() {
        // Missing object: the width fails at fetch after the delay
        let store = Arc::new(SlowBlobStore {
            inner: MemoryBlobStore::new(),
            delay: Duration::from_secs(50),
        });
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store, alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("email-in", "x_image_png_0"))
            .await;

        assert!(report.timed_out);
        assert_eq!(report.failed_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let alerts = alerts.alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].starts_with("email-in/x_image_png_0-H"));
        assert!(alerts[1].starts_with("Unable to resize email-in/x_image_png_0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_run_clears_watchdog() {
        let store = Arc::new(MemoryBlobStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());

        let report = pipeline(store, alerts.clone(), PipelineConfig::default())
            .run(SourceObject::new("photos", "missing_image_png_0"))
            .await;
        assert!(!report.timed_out);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let alerts = alerts.alerts();
        // Only the two fetch failures, no timeout
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.starts_with("Unable to resize")));
    }

    /// Delivers each alert to `delivered` after `delay`
    struct DelayedAlertSink {
        delay: Duration,
        deliveries: PendingDeliveries,
        delivered: Arc<RecordingAlertSink>,
    }

    impl DelayedAlertSink {
        fn new(delay: Duration, delivered: Arc<RecordingAlertSink>) -> Self {
            Self {
                delay,
                deliveries: PendingDeliveries::new(),
                delivered,
            }
        }
    }

    #[async_trait]
    impl AlertSink for DelayedAlertSink {
        fn notify(&self, text: &str) {
            let delay = self.delay;
            let delivered = self.delivered.clone();
            let text = text.to_string();
            self.deliveries.spawn(async move {
                tokio::time::sleep(delay).await;
                delivered.notify(&text);
            });
        }

        async fn flush(&self) {
            self.deliveries.wait().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_alerts_waits_for_deliveries() {
        let delivered = Arc::new(RecordingAlertSink::new());
        let sink = Arc::new(DelayedAlertSink::new(
            Duration::from_secs(3),
            delivered.clone(),
        ));
        let pipeline = ThumbnailPipeline::new(
            Arc::new(MemoryBlobStore::new()),
            sink,
            PipelineConfig::default(),
        );

        let report = pipeline
            .run(SourceObject::new("photos", "missing_image_png_0"))
            .await;
        assert_eq!(report.failed_count(), 2);
        assert!(delivered.alerts().is_empty());

        assert!(pipeline.flush_alerts(Duration::from_secs(10)).await);
        assert_eq!(delivered.alerts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_alerts_stops_at_limit() {
        let delivered = Arc::new(RecordingAlertSink::new());
        let sink = Arc::new(DelayedAlertSink::new(
            Duration::from_secs(30),
            delivered.clone(),
        ));
        let pipeline = ThumbnailPipeline::new(
            Arc::new(MemoryBlobStore::new()),
            sink,
            PipelineConfig::default(),
        );

        pipeline
            .run(SourceObject::new("email-in", "missing_image_png_0"))
            .await;

        let start = tokio::time::Instant::now();
        assert!(!pipeline.flush_alerts(Duration::from_secs(1)).await);
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(delivered.alerts().is_empty());
    }
}
