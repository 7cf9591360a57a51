//! Client for the external forecast service.

use crate::config::ForecastConfig;
use crate::planner::EnergySeries;
use crate::readings::PlantReadings;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Demand and production curves from one forecast call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Forecasts {
    pub hot_demand: EnergySeries,
    pub cold_demand: EnergySeries,
    pub hot_production: EnergySeries,
    pub cold_production: EnergySeries,
    pub rain: Value,
}

#[derive(Deserialize)]
struct ForecastResponse {
    info: ForecastInfo,
}

#[derive(Deserialize)]
struct ForecastInfo {
    demand: DemandInfo,
    #[serde(rename = "energy-production")]
    production: ProductionInfo,
    #[serde(rename = "rain-prediction", default)]
    rain: Value,
}

#[derive(Deserialize)]
struct DemandInfo {
    #[serde(default)]
    hot_dem: EnergySeries,
    #[serde(default)]
    cold_dem: EnergySeries,
}

#[derive(Deserialize)]
struct ProductionInfo {
    #[serde(default)]
    hot: EnergySeries,
    #[serde(default)]
    cold: EnergySeries,
}

impl From<ForecastResponse> for Forecasts {
    fn from(r: ForecastResponse) -> Forecasts {
        Forecasts {
            hot_demand: r.info.demand.hot_dem,
            cold_demand: r.info.demand.cold_dem,
            hot_production: r.info.production.hot,
            cold_production: r.info.production.cold,
            rain: r.info.rain,
        }
    }
}

pub fn parse_forecasts(body: &str) -> Result<Forecasts> {
    let response: ForecastResponse =
        serde_json::from_str(body).context("forecast response is not the expected JSON")?;
    Ok(response.into())
}

pub trait ForecastSource: Send + Sync + 'static {
    fn fetch(&self, readings: &PlantReadings) -> impl Future<Output = Result<Forecasts>> + Send;
}

pub struct HttpForecastClient {
    client: reqwest::Client,
    url: String,
    retries: u32,
    backoff: Duration,
}

impl HttpForecastClient {
    pub fn new(url: impl Into<String>, config: &ForecastConfig) -> Result<HttpForecastClient> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(HttpForecastClient {
            client,
            url: url.into(),
            retries: config.retries.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
        })
    }

    async fn attempt(&self, readings: &PlantReadings) -> Result<Forecasts> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(readings)
            .send()
            .await
            .context("forecast request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("forecast service answered HTTP {}", status);
        }
        let body = response.text().await.context("reading forecast response")?;
        parse_forecasts(&body)
    }
}

impl ForecastSource for HttpForecastClient {
    async fn fetch(&self, readings: &PlantReadings) -> Result<Forecasts> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.attempt(readings).await {
                Ok(forecasts) => {
                    info!(
                        attempt,
                        hot_production = forecasts.hot_production.len(),
                        cold_production = forecasts.cold_production.len(),
                        "forecasts received"
                    );
                    return Ok(forecasts);
                }
                Err(e) if attempt < self.retries => {
                    warn!(attempt, retries = self.retries, "forecast attempt failed: {:#}", e);
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("no forecast from {} after {} attempts", self.url, self.retries)
                    })
                }
            }
        }
    }
}
