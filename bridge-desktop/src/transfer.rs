//! Transfer Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transfer::{TransferClient, TransferProgress},
};
use core_async::sync::mpsc;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Reqwest-based foreground transfer client
///
/// Streams the response body straight to disk and reports progress per
/// chunk. Never retries; the caller decides what a failure means.
pub struct ReqwestTransferClient {
    client: Client,
}

impl ReqwestTransferClient {
    /// Create a new transfer client with default configuration
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new transfer client with a custom connect timeout
    ///
    /// Episodes can be large, so no overall request timeout is applied.
    pub fn with_connect_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent("episode-cache/0.1.0")
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "Falling back to default HTTP client");
                Client::new()
            });

        Self { client }
    }

    /// Create a new transfer client around a preconfigured reqwest client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request_error(e: reqwest::Error) -> BridgeError {
        if e.is_timeout() {
            BridgeError::OperationFailed("Request timed out".to_string())
        } else if e.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", e))
        } else {
            BridgeError::OperationFailed(e.to_string())
        }
    }
}

impl Default for ReqwestTransferClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferClient for ReqwestTransferClient {
    async fn fetch(
        &self,
        locator: &str,
        destination: &Path,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<u64> {
        debug!(destination = ?destination, "Starting transfer");

        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(Self::request_error)?;

        if !response.status().is_success() {
            return Err(BridgeError::OperationFailed(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let expected = response.content_length();
        let mut file = fs::File::create(destination)
            .await
            .map_err(BridgeError::Io)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::request_error)?;
            file.write_all(&chunk).await.map_err(BridgeError::Io)?;
            written += chunk.len() as u64;
            // A dropped receiver only means nobody watches progress.
            let _ = progress.send(TransferProgress::new(written, expected));
        }

        file.flush().await.map_err(BridgeError::Io)?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(BridgeError::OperationFailed(format!(
                    "Truncated body: {} of {} bytes",
                    written, expected
                )));
            }
        }

        debug!(bytes = written, "Transfer finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the URL to fetch.
    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}/episode.mp3", addr)
    }

    #[tokio::test]
    async fn test_fetch_writes_body_and_reports_progress() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("episode.part");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let written = ReqwestTransferClient::new()
            .fetch(&url, &destination, tx)
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");

        let mut last = None;
        while let Ok(progress) = rx.try_recv() {
            last = Some(progress);
        }
        assert_eq!(last, Some(TransferProgress::new(11, Some(11))));
    }

    #[tokio::test]
    async fn test_http_error_is_failure() {
        let url =
            serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = ReqwestTransferClient::new()
            .fetch(&url, &dir.path().join("episode.part"), tx)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
    }
}
