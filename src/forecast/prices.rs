use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::ForecastPoint;

/// Optional price-forecast collaborator. A failed or timed-out fetch is
/// reported upward as an absent forecast (confidence 0), never as a crash.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch_forecast(&self) -> Result<Vec<ForecastPoint>>;
}

/// Forecast client for a JSON endpoint publishing hourly price predictions
/// with per-point confidence.
#[derive(Clone)]
pub struct HttpForecastClient {
    base_url: String,
    client: ClientWithMiddleware,
}

impl HttpForecastClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridpilot/0.3"));
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let client = reqwest_middleware::ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self { base_url, client })
    }

    fn url(&self) -> String {
        format!("{}/api/v1/price-forecast", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ForecastSource for HttpForecastClient {
    async fn fetch_forecast(&self) -> Result<Vec<ForecastPoint>> {
        let resp = self
            .client
            .get(self.url())
            .send()
            .await
            .context("forecast GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("forecast read failed")?;
        if !status.is_success() {
            anyhow::bail!("forecast API error: HTTP {status}: {body}");
        }

        let raw: Vec<RawForecast> =
            serde_json::from_str(&body).context("forecast JSON parse failed")?;
        Ok(raw
            .into_iter()
            .map(|r| ForecastPoint {
                timestamp: r.timestamp,
                price_pln_kwh: r.price_pln_kwh,
                confidence: r.confidence.clamp(0.0, 1.0),
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct RawForecast {
    timestamp: DateTime<Utc>,
    price_pln_kwh: f64,
    confidence: f64,
}
