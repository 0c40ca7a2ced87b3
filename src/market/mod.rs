use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::write_atomic;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Price API request failed: {0}")]
    Http(String),
    #[error("Price payload malformed: {0}")]
    Parse(String),
    #[error("Price data unavailable")]
    Unavailable,
}

/// One raw market slot before tariff adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPricePoint {
    pub timestamp: DateTime<Utc>,
    pub market_price_pln_mwh: f64,
}

/// Day-ahead price collaborator.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_day_ahead(&self, business_date: NaiveDate)
        -> Result<Vec<RawPricePoint>, MarketError>;
}

/// PSE day-ahead (CSDAC) client. Quotes arrive in PLN/MWh at 15-min or
/// hourly granularity, stamped in local market time.
#[derive(Clone)]
pub struct PseDayAheadClient {
    base_url: String,
    client: ClientWithMiddleware,
    market_tz: Tz,
}

impl PseDayAheadClient {
    pub fn new(base_url: String, timeout: Duration, market_tz: Tz) -> anyhow::Result<Self> {
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
        Ok(Self {
            base_url,
            client,
            market_tz,
        })
    }

    fn url_for(&self, business_date: NaiveDate) -> String {
        format!(
            "{}/api/csdac-pln?$filter=business_date eq '{}'",
            self.base_url.trim_end_matches('/'),
            business_date.format("%Y-%m-%d"),
        )
    }
}

#[async_trait]
impl PriceSource for PseDayAheadClient {
    async fn fetch_day_ahead(
        &self,
        business_date: NaiveDate,
    ) -> Result<Vec<RawPricePoint>, MarketError> {
        let url = self.url_for(business_date);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketError::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| MarketError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(MarketError::Http(format!("HTTP {status}: {body}")));
        }

        let payload: CsdacResponse =
            serde_json::from_str(&body).map_err(|e| MarketError::Parse(e.to_string()))?;

        let mut points = Vec::with_capacity(payload.value.len());
        for row in payload.value {
            let naive = NaiveDateTime::parse_from_str(&row.dtime, "%Y-%m-%d %H:%M")
                .map_err(|e| MarketError::Parse(format!("bad dtime {}: {e}", row.dtime)))?;
            // DST gaps yield no local representation; skip the slot rather
            // than fail the whole day
            let Some(local) = naive.and_local_timezone(self.market_tz).earliest() else {
                debug!(dtime = %row.dtime, "skipping slot without local representation");
                continue;
            };
            points.push(RawPricePoint {
                timestamp: local.with_timezone(&Utc),
                market_price_pln_mwh: row.csdac_pln,
            });
        }
        if points.is_empty() {
            return Err(MarketError::Unavailable);
        }
        Ok(points)
    }
}

#[derive(Debug, Deserialize)]
struct CsdacResponse {
    value: Vec<CsdacRow>,
}

#[derive(Debug, Deserialize)]
struct CsdacRow {
    dtime: String,
    csdac_pln: f64,
}

/// On-disk cache of the last fetched curve, so a restart inside a business
/// day does not hit the API again and a dead API still leaves yesterday's
/// data available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPrices {
    pub business_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub points: Vec<RawPricePoint>,
}

#[derive(Debug)]
pub struct PriceCacheFile {
    path: PathBuf,
}

impl PriceCacheFile {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            path: data_dir.join("price_cache.json"),
        }
    }

    pub fn load(&self) -> Option<CachedPrices> {
        let bytes = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "discarding unreadable price cache");
                None
            }
        }
    }

    pub fn store(&self, cached: &CachedPrices) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(cached)?;
        write_atomic(&self.path, &bytes)
    }
}
