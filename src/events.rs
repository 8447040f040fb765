use std::fmt;

use aws_lambda_events::s3::S3Event;
use lambda_runtime::Context;
use thiserror::Error;

use crate::naming::decode_key;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("S3 event contains no records")]
    NoRecords,

    #[error("Missing bucket name")]
    MissingBucket,

    #[error("Missing object key")]
    MissingKey,
}

/// The uploaded object that triggered an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    pub bucket: String,
    /// Decoded object key
    pub key: String,
}

impl SourceObject {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Take the source object from the first record of an S3 notification.
    /// Any further records are ignored.
    pub fn from_event(event: &S3Event) -> Result<Self, EventError> {
        let record = event.records.first().ok_or(EventError::NoRecords)?;

        let bucket = record
            .s3
            .bucket
            .name
            .as_deref()
            .ok_or(EventError::MissingBucket)?;
        let raw_key = record
            .s3
            .object
            .key
            .as_deref()
            .ok_or(EventError::MissingKey)?;

        Ok(Self::new(bucket, decode_key(raw_key)))
    }
}

impl fmt::Display for SourceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// An S3 notification delivered by the Lambda runtime
pub struct ThumbnailEvent {
    pub payload: S3Event,
    pub context: Context,
}

impl ThumbnailEvent {
    pub fn new(payload: S3Event, context: Context) -> Self {
        Self { payload, context }
    }
}
