use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::FabricConfig;
use crate::error::FetchError;

use super::{
    GroupConfig, GroupInfo, ImageId, ImageInfo, Notice, PerformanceSource, PmConfig,
    PortCounters, VfConfig, VfInfo,
};

/// Callback type for recording fabric request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// HTTP/JSON client for the fabric performance service.
pub struct HttpSource {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    metrics: Option<MetricsCallback>,
}

impl HttpSource {
    pub fn new(cfg: &FabricConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            timeout,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                after: self.timeout,
            }
        } else if err.is_connect() {
            FetchError::Io(err.to_string())
        } else {
            FetchError::Runtime(err.to_string())
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        name: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, path);

        let response = match self
            .http
            .get(&url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.record_request(name, "error", start.elapsed());
                return Err(self.classify(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(name, "error", start.elapsed());
            return Err(FetchError::Runtime(format!(
                "unexpected status {status} from {path}: {body}"
            )));
        }

        let result = response.json::<T>().await.map_err(|e| {
            self.record_request(name, "error", start.elapsed());
            FetchError::Runtime(format!("decoding response from {path}: {e}"))
        })?;

        self.record_request(name, "success", start.elapsed());
        Ok(result)
    }
}

fn image_query(image: ImageId) -> [(&'static str, String); 2] {
    [
        ("image", image.number.to_string()),
        ("offset", image.offset.to_string()),
    ]
}

impl PerformanceSource for HttpSource {
    async fn image_info(&self, image: ImageId) -> Result<ImageInfo, FetchError> {
        debug!(image = %image, "fetching image info");
        self.get_json("image_info", "/v1/images", &image_query(image))
            .await
    }

    async fn group_list(&self) -> Result<Vec<String>, FetchError> {
        self.get_json("group_list", "/v1/groups", &[]).await
    }

    async fn group_info(&self, group: &str, image: ImageId) -> Result<GroupInfo, FetchError> {
        let [img, off] = image_query(image);
        self.get_json(
            "group_info",
            "/v1/groups/info",
            &[("name", group.to_string()), img, off],
        )
        .await
    }

    async fn group_config(&self, group: &str) -> Result<GroupConfig, FetchError> {
        self.get_json(
            "group_config",
            "/v1/groups/config",
            &[("name", group.to_string())],
        )
        .await
    }

    async fn vf_list(&self) -> Result<Vec<String>, FetchError> {
        self.get_json("vf_list", "/v1/vfs", &[]).await
    }

    async fn vf_info(&self, vf: &str, image: ImageId) -> Result<VfInfo, FetchError> {
        let [img, off] = image_query(image);
        self.get_json("vf_info", "/v1/vfs/info", &[("name", vf.to_string()), img, off])
            .await
    }

    async fn vf_config(&self, vf: &str) -> Result<VfConfig, FetchError> {
        self.get_json("vf_config", "/v1/vfs/config", &[("name", vf.to_string())])
            .await
    }

    async fn port_counters(
        &self,
        lid: u32,
        port: u8,
        image: ImageId,
    ) -> Result<PortCounters, FetchError> {
        let [img, off] = image_query(image);
        self.get_json(
            "port_counters",
            "/v1/ports/counters",
            &[("lid", lid.to_string()), ("port", port.to_string()), img, off],
        )
        .await
    }

    async fn pm_config(&self) -> Result<PmConfig, FetchError> {
        self.get_json("pm_config", "/v1/pm/config", &[]).await
    }

    async fn notices(&self) -> Result<Vec<Notice>, FetchError> {
        self.get_json("notices", "/v1/notices", &[]).await
    }
}
