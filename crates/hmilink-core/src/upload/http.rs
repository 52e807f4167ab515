//! HTTP range transport for firmware images
//!
//! The upload engine never holds a whole TFT image in memory; it asks for
//! byte ranges as the display consumes them. The transport is a trait so the
//! transfer loop can be tested without a server.

use super::UploadError;

/// One answered range request
#[derive(Debug, Clone)]
pub struct RangeResponse {
    /// HTTP status code
    pub status: u16,
    /// Total size of the image, from the Content-Range header
    pub total_size: Option<u64>,
    /// Body bytes for the requested range
    pub body: Vec<u8>,
}

/// Fetches inclusive byte ranges of a firmware image
pub trait RangeClient {
    fn fetch(&mut self, url: &str, start: u64, end: u64) -> Result<RangeResponse, UploadError>;
}

/// Range client backed by a blocking reqwest client
pub struct HttpRangeClient {
    client: reqwest::blocking::Client,
}

impl HttpRangeClient {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent("HMILink/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        HttpRangeClient { client }
    }
}

impl Default for HttpRangeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeClient for HttpRangeClient {
    fn fetch(&mut self, url: &str, start: u64, end: u64) -> Result<RangeResponse, UploadError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let total_size = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let body = response
            .bytes()
            .map_err(|e| UploadError::Transport(e.to_string()))?
            .to_vec();

        Ok(RangeResponse {
            status,
            total_size,
            body,
        })
    }
}

/// Extract the total size from a Content-Range header such as
/// `bytes 0-255/1048576`
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range("bytes 0-255/1048576"), Some(1_048_576));
        assert_eq!(parse_content_range("bytes 0-255/4096"), Some(4096));
    }

    #[test]
    fn content_range_malformed() {
        assert_eq!(parse_content_range("bytes 0-255"), None);
        assert_eq!(parse_content_range("bytes 0-255/*"), None);
        assert_eq!(parse_content_range(""), None);
    }
}
