/// Thumbnail widths written for regular uploads
pub const DEFAULT_WIDTHS: [u32; 2] = [400, 1024];

/// Email attachments only get the small thumbnail
pub const EMAIL_WIDTHS: [u32; 1] = [400];

/// Ordered list of thumbnail widths to produce for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    widths: Vec<u32>,
}

impl ResizePlan {
    /// Choose the widths based on the bucket the object was uploaded to.
    /// The `email` match is case-sensitive.
    pub fn for_bucket(bucket: &str) -> Self {
        let widths = if bucket.contains("email") {
            EMAIL_WIDTHS.to_vec()
        } else {
            DEFAULT_WIDTHS.to_vec()
        };
        Self { widths }
    }

    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }
}
