use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use birdwatch_types::{config::CameraConfig, vision::Frame, BirdwatchError, Result};
use chrono::Local;
use tracing::{debug, warn};

use crate::{capture_error, decode_error, CaptureMetrics, ImageSource};

/// Pulls a single still from a camera endpoint such as an ESP32-CAM
/// `/capture` handler.
pub struct HttpImageSource {
    url: String,
    client: reqwest::Client,
    metrics: Arc<Mutex<CaptureMetrics>>,
}

impl HttpImageSource {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|err| {
                BirdwatchError::Configuration(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self {
            url: config.url.clone(),
            client,
            metrics: Arc::new(Mutex::new(CaptureMetrics::default())),
        })
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| capture_error(format!("request to {} failed: {err}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(capture_error(format!(
                "camera {} answered HTTP {}",
                self.url,
                status.as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| capture_error(format!("reading body from {} failed: {err}", self.url)))?;
        Ok(body.to_vec())
    }

    fn record_success(&self, bytes: usize) {
        if let Ok(mut guard) = self.metrics.lock() {
            guard.successful_captures += 1;
            guard.last_bytes = bytes;
        }
    }

    fn record_failure(&self) {
        if let Ok(mut guard) = self.metrics.lock() {
            guard.failed_captures += 1;
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn probe(&self) -> Result<()> {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Camera {} reachable", self.url);
                Ok(())
            }
            Ok(response) => {
                warn!(
                    "Camera {} reachable but answered HTTP {}; continuing",
                    self.url,
                    response.status().as_u16()
                );
                Ok(())
            }
            Err(err) => Err(BirdwatchError::Configuration(format!(
                "camera {} is unreachable: {err}",
                self.url
            ))),
        }
    }

    async fn capture(&self) -> Result<Frame> {
        let body = match self.fetch().await {
            Ok(body) => body,
            Err(err) => {
                self.record_failure();
                return Err(err);
            }
        };
        let captured_at = Local::now();
        let image = match image::load_from_memory(&body) {
            Ok(image) => image,
            Err(err) => {
                self.record_failure();
                return Err(decode_error(format!(
                    "{} bytes from {} are not a decodable image: {err}",
                    body.len(),
                    self.url
                )));
            }
        };
        self.record_success(body.len());
        let frame = Frame::from_image(image, captured_at);
        debug!(
            "Captured {}x{} frame ({} bytes)",
            frame.width,
            frame.height,
            body.len()
        );
        Ok(frame)
    }

    fn metrics(&self) -> CaptureMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{codecs::png::PngEncoder, ColorType, ImageEncoder};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Serves one canned HTTP/1.1 response and returns the URL to hit.
    async fn serve_once(status: &'static str, content_type: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut request = Vec::new();
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/capture")
    }

    fn source_for(url: String) -> HttpImageSource {
        HttpImageSource::new(&CameraConfig {
            url,
            timeout_secs: 2.0,
            probe_on_start: true,
        })
        .expect("client")
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![200u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(&pixels, width, height, ColorType::Rgb8)
            .expect("encode png");
        out
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let url = serve_once("500 Internal Server Error", "text/plain", b"boom".to_vec()).await;
        let source = source_for(url);
        let err = source.capture().await.expect_err("500 must fail");
        assert!(matches!(err, BirdwatchError::Network(_)), "{err}");
        assert!(err.to_string().contains("500"));
        assert_eq!(source.metrics().failed_captures, 1);
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let url = serve_once("200 OK", "image/jpeg", b"definitely not a jpeg".to_vec()).await;
        let source = source_for(url);
        let err = source.capture().await.expect_err("garbage must fail");
        assert!(matches!(err, BirdwatchError::Decode(_)), "{err}");
    }

    #[tokio::test]
    async fn decodes_image_body() {
        let url = serve_once("200 OK", "image/png", png_bytes(8, 6)).await;
        let source = source_for(url);
        let frame = source.capture().await.expect("capture");
        assert_eq!((frame.width, frame.height), (8, 6));
        assert_eq!(frame.data.len(), 8 * 6 * 3);
        assert_eq!(source.metrics().successful_captures, 1);
    }

    #[tokio::test]
    async fn probe_fails_only_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let source = source_for(format!("http://{addr}/capture"));
        let err = source.probe().await.expect_err("closed port");
        assert!(err.is_fatal());

        let url = serve_once("503 Service Unavailable", "text/plain", Vec::new()).await;
        assert!(source_for(url).probe().await.is_ok());
    }
}
