// HTTP StationSource
// Reads the operator's public station list

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use transit_core::error::{AppError, Result};
use transit_core::port::{StationSource, UpstreamStation};

pub const DEFAULT_STATIONS_BASE_URL: &str = "https://www.gautrain.co.za";
const STATIONS_PATH: &str = "/commuter/stations";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpStationSource {
    client: Client,
    url: String,
}

impl HttpStationSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), STATIONS_PATH),
        })
    }
}

#[async_trait]
impl StationSource for HttpStationSource {
    /// Transport and status failures are `Execution` errors, so the sync job retries them
    async fn fetch_stations(&self) -> Result<Vec<UpstreamStation>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AppError::Execution(format!("Station list request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Execution(format!(
                "Station list request to {} returned {}",
                self.url, status
            )));
        }

        let stations: Vec<UpstreamStation> = response
            .json()
            .await
            .map_err(|e| AppError::Execution(format!("Failed to parse station list: {}", e)))?;

        debug!(count = stations.len(), url = %self.url, "Fetched station list");
        Ok(stations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const BODY: &str = r#"[
        {"id": "GT-SAN", "name": "Sandton", "geometry": {"type": "Point", "coordinates": [28.0567, -26.1076]}, "modes": ["Train", "Bus"]},
        {"id": "GT-PARK", "name": "Park"}
    ]"#;

    /// Serves one canned response and returns the base url
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let n = socket.read(&mut request).await.unwrap();
            assert!(String::from_utf8_lossy(&request[..n]).starts_with("GET /commuter/stations "));
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_fetches_and_parses_station_list() {
        let base_url = serve_once("200 OK", BODY).await;
        let source = HttpStationSource::new(&base_url).unwrap();

        let stations = source.fetch_stations().await.unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].id, "GT-SAN");
        assert_eq!(stations[0].modes, vec!["Train", "Bus"]);
        assert_eq!(stations[0].location().latitude, -26.1076);
        assert!(stations[1].modes.is_empty());
        assert_eq!(stations[1].location().longitude, 0.0);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let base_url = serve_once("503 Service Unavailable", "").await;
        let source = HttpStationSource::new(&base_url).unwrap();

        let err = source.fetch_stations().await.unwrap_err();
        assert!(matches!(err, AppError::Execution(_)));
        assert!(err.is_retryable());
    }
}
