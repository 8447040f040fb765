use chrono::Utc;
use tracing::{debug, error, info};

use crate::alert::{AlertSink, with_clock_suffix};
use crate::events::SourceObject;
use crate::naming::DerivedNaming;
use crate::store::BlobStore;

use super::resize::{Dimensions, render_thumbnail};
use super::{ResizeOutcome, ThumbnailError};

/// One thumbnail width to fetch, render and store
pub struct WidthTask<'a> {
    index: usize,
    width: u32,
    source: &'a SourceObject,
    naming: &'a DerivedNaming,
    store: &'a dyn BlobStore,
    alerts: &'a dyn AlertSink,
}

impl<'a> WidthTask<'a> {
    pub fn new(
        index: usize,
        width: u32,
        source: &'a SourceObject,
        naming: &'a DerivedNaming,
        store: &'a dyn BlobStore,
        alerts: &'a dyn AlertSink,
    ) -> Self {
        Self {
            index,
            width,
            source,
            naming,
            store,
            alerts,
        }
    }

    /// Run the task. Failures are logged and alerted here and never returned
    /// as errors, so one width cannot abort the others.
    pub async fn process(self) -> ResizeOutcome {
        let destination = self.naming.destination_key(self.width);

        let outcome = match self.resize_and_store(&destination).await {
            Ok(dimensions) => {
                info!(
                    width = self.width,
                    dimensions = %dimensions,
                    "Successfully resized {} and uploaded to {}/{}",
                    self.source,
                    self.source.bucket,
                    destination
                );
                ResizeOutcome::Stored {
                    width: self.width,
                    key: destination,
                    dimensions,
                }
            }
            Err(e) => {
                let message = format!(
                    "Unable to resize {} and upload to {}/{} due to an error: {}",
                    self.source, self.source.bucket, destination, e
                );
                error!(width = self.width, error = %e, "{}", message);
                self.alerts.notify(&with_clock_suffix(&message, Utc::now()));

                ResizeOutcome::Failed {
                    width: self.width,
                    key: destination,
                    error: e,
                }
            }
        };

        info!(index = self.index, width = self.width, "Width done");
        outcome
    }

    async fn resize_and_store(&self, destination: &str) -> Result<Dimensions, ThumbnailError> {
        let original = self
            .store
            .get(&self.source.bucket, &self.source.key)
            .await
            .map_err(|e| ThumbnailError::Fetch(e.to_string()))?;

        // The upload keeps the content type S3 has on record for the original
        let content_type = original
            .content_type
            .unwrap_or_else(|| self.naming.content_type());

        let width = self.width;
        let kind = self.naming.image_kind.clone();
        let body = original.body;
        let thumbnail =
            tokio::task::spawn_blocking(move || render_thumbnail(&body, width, &kind))
                .await
                .map_err(|e| ThumbnailError::Resize(format!("thumbnail task panicked: {}", e)))??;

        debug!(
            width = self.width,
            native = %thumbnail.native,
            dimensions = %thumbnail.dimensions,
            size = thumbnail.data.len(),
            content_type = %content_type,
            "Rendered thumbnail"
        );

        self.store
            .put(
                &self.source.bucket,
                destination,
                thumbnail.data,
                &content_type,
            )
            .await
            .map_err(|e| ThumbnailError::Store(e.to_string()))?;

        Ok(thumbnail.dimensions)
    }
}
