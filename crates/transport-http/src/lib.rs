use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Url;

/// Boxed byte stream used for upload bodies and fetched ciphertext.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

const FILENAME_MAX_LEN: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("record not found")]
    NotFound,
    #[error("server rejected request ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("transfer stream interrupted: {0}")]
    Interrupted(#[source] std::io::Error),
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Interrupted(_) => true,
            RemoteError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True when the failure happened before a connection existed, so the
    /// remote side cannot have accepted any bytes.
    pub fn is_connect(&self) -> bool {
        matches!(self, RemoteError::Network(e) if e.is_connect())
    }
}

/// Descriptor accompanying an uploaded ciphertext stream.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub transfer_id: String,
    /// Record nonce, hex encoded, sent as the `iv` form field.
    pub nonce_hex: String,
    pub filename: String,
    pub mime_type: String,
}

/// Metadata for one stored record, as the server reports it. Only `filename`
/// is guaranteed by the contract; the size and content type are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMetadata {
    pub filename: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: Option<u64>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
}

impl RemoteMetadata {
    /// Boundary check on server-supplied fields before anything uses them.
    fn validate(&self) -> Result<(), RemoteError> {
        if self.filename.is_empty() {
            return Err(RemoteError::InvalidResponse(
                "metadata filename is empty".into(),
            ));
        }
        if self.filename.len() > FILENAME_MAX_LEN {
            return Err(RemoteError::InvalidResponse(
                "metadata filename too long".into(),
            ));
        }
        if self
            .filename
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(RemoteError::InvalidResponse(
                "metadata filename contains path separators or control characters".into(),
            ));
        }
        Ok(())
    }
}

/// One ciphertext response: the offset the server says the stream starts at,
/// the total resource length when reported, and the body itself.
pub struct CiphertextFetch {
    pub start_offset: u64,
    pub total_len: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for CiphertextFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextFetch")
            .field("start_offset", &self.start_offset)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct UploadAck {
    #[serde(rename = "fileId")]
    file_id: String,
}

/// Remote store the transfer coordinators talk to.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload one record as a single logical request. Returns the file ID the
    /// server acknowledged; the record exists only once this returns Ok.
    async fn put_record(&self, record: &NewRecord, body: ByteStream)
        -> Result<String, RemoteError>;

    /// Resolve a transfer ID to its stored metadata.
    async fn fetch_metadata(&self, transfer_id: &str) -> Result<RemoteMetadata, RemoteError>;

    /// Open the ciphertext stream for `filename`, starting at byte `offset`.
    async fn fetch_ciphertext(
        &self,
        filename: &str,
        offset: u64,
    ) -> Result<CiphertextFetch, RemoteError>;
}

/// HTTP implementation of the remote store contract:
/// `POST /upload` (multipart), `GET /download/{fileId}`, `GET /file/{filename}`
/// with byte-range support. One instance holds one connection pool and is safe
/// to share across concurrent transfers.
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
}

impl HttpRemote {
    pub fn new(base: Url) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::InvalidRequest(format!("unusable endpoint {path}: {e}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn put_record(
        &self,
        record: &NewRecord,
        body: ByteStream,
    ) -> Result<String, RemoteError> {
        let url = self.endpoint("/upload")?;

        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(body))
            .file_name(record.filename.clone())
            .mime_str(&record.mime_type)
            .map_err(|e| RemoteError::InvalidRequest(format!("content type rejected: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("fileId", record.transfer_id.clone())
            .text("iv", record.nonce_hex.clone());

        tracing::debug!("POST {} ({})", url, record.transfer_id);
        let resp = self.client.post(url).multipart(form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let ack: UploadAck = resp
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("upload ack: {e}")))?;
        if ack.file_id.is_empty() {
            return Err(RemoteError::InvalidResponse(
                "upload ack has an empty fileId".into(),
            ));
        }
        Ok(ack.file_id)
    }

    async fn fetch_metadata(&self, transfer_id: &str) -> Result<RemoteMetadata, RemoteError> {
        let url = self.endpoint(&format!("/download/{transfer_id}"))?;

        tracing::debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let meta: RemoteMetadata = resp
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("metadata body: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }

    async fn fetch_ciphertext(
        &self,
        filename: &str,
        offset: u64,
    ) -> Result<CiphertextFetch, RemoteError> {
        // Pushed as a segment so characters like '#', '?', or '/' are
        // percent-encoded instead of splitting the URL.
        let mut url = self.endpoint("/file/")?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidRequest("server URL cannot hold paths".into()))?
            .pop_if_empty()
            .push(filename);

        let mut req = self.client.get(url.clone());
        if offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        tracing::debug!("GET {} (offset {})", url, offset);
        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }

        // A plain 200 means the server served the whole resource from zero,
        // whether or not a range was requested.
        let (start_offset, total_len) = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            parse_content_range(resp.headers())?
        } else {
            (0, resp.content_length())
        };

        let stream = resp.bytes_stream().map(|item| item.map_err(into_io_error));
        Ok(CiphertextFetch {
            start_offset,
            total_len,
            stream: Box::pin(stream),
        })
    }
}

/// Parse `Content-Range: bytes <start>-<end>/<total>`; `<total>` may be `*`.
fn parse_content_range(
    headers: &reqwest::header::HeaderMap,
) -> Result<(u64, Option<u64>), RemoteError> {
    let raw = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            RemoteError::InvalidResponse("partial content without a content-range header".into())
        })?;

    let unparseable = || RemoteError::InvalidResponse(format!("unparseable content-range: {raw}"));

    let rest = raw.strip_prefix("bytes ").ok_or_else(unparseable)?;
    let (range, total) = rest.split_once('/').ok_or_else(unparseable)?;
    let (start, _end) = range.split_once('-').ok_or_else(unparseable)?;

    let start = start.trim().parse::<u64>().map_err(|_| unparseable())?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| unparseable())?),
    };
    Ok((start, total))
}

fn into_io_error(err: reqwest::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn content_range_with_total() {
        let (start, total) = parse_content_range(&headers_with("bytes 100-199/200")).unwrap();
        assert_eq!(start, 100);
        assert_eq!(total, Some(200));
    }

    #[test]
    fn content_range_with_unknown_total() {
        let (start, total) = parse_content_range(&headers_with("bytes 5-9/*")).unwrap();
        assert_eq!(start, 5);
        assert_eq!(total, None);
    }

    #[test]
    fn content_range_rejects_garbage() {
        assert!(parse_content_range(&headers_with("items 1-2/3")).is_err());
        assert!(parse_content_range(&headers_with("bytes abc-9/10")).is_err());
        assert!(parse_content_range(&headers_with("bytes 1-9")).is_err());
        assert!(parse_content_range(&HeaderMap::new()).is_err());
    }

    #[test]
    fn metadata_validation() {
        let ok = RemoteMetadata {
            filename: "report.pdf".into(),
            size_bytes: Some(10),
            mime_type: None,
        };
        assert!(ok.validate().is_ok());

        for bad in ["", "a/b.txt", "a\\b.txt", "evil\nname"] {
            let meta = RemoteMetadata {
                filename: bad.into(),
                size_bytes: None,
                mime_type: None,
            };
            assert!(meta.validate().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Http {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::NotFound.is_transient());
        assert!(!RemoteError::InvalidResponse("x".into()).is_transient());
        assert!(
            RemoteError::Interrupted(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                .is_transient()
        );
        assert!(!RemoteError::NotFound.is_connect());
    }
}
