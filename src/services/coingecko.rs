//! CoinGecko `simple/price` client behind the `PriceProvider` seam.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Why a quote lookup against the provider failed.
///
/// `RateLimited` and `Unreachable` are transient and eligible for stale
/// fallback. `MalformedResponse` may apply to a single symbol of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("quote provider rate limit hit")]
    RateLimited,
    #[error("quote provider unreachable: {0}")]
    Unreachable(String),
    #[error("malformed quote provider response: {0}")]
    MalformedResponse(String),
}

/// Per-symbol outcome of one batched lookup
pub type PriceBatch = HashMap<String, Result<f64, UpstreamError>>;

/// Batched USD price lookup. Implementations never retry.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// `coin_ids` are canonical (lowercase) CoinGecko ids.
    /// Every requested id is present in the returned batch.
    async fn fetch(&self, coin_ids: &[String]) -> Result<PriceBatch, UpstreamError>;
}

#[derive(Clone)]
pub struct CoinGeckoService {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl CoinGeckoService {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoService {
    async fn fetch(&self, coin_ids: &[String]) -> Result<PriceBatch, UpstreamError> {
        if coin_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/simple/price", self.base_url);
        let ids = coin_ids.join(",");

        tracing::info!("Fetching {} prices from CoinGecko", coin_ids.len());

        let mut request = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .query(&[("ids", ids.as_str()), ("vs_currencies", "usd")]);

        if let Some(api_key) = &self.api_key {
            request = request.header("x-cg-pro-api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("CoinGecko rate limit hit for {} ids", coin_ids.len());
            return Err(UpstreamError::RateLimited);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Unreachable(format!(
                "CoinGecko API error {}: {}",
                status, error_text
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;

        parse_simple_price(&body, coin_ids)
    }
}

/// Pick the `usd` price of every requested id out of a `/simple/price` body,
/// e.g. `{"bitcoin": {"usd": 96721.0}}`.
fn parse_simple_price(body: &Value, coin_ids: &[String]) -> Result<PriceBatch, UpstreamError> {
    let object = body.as_object().ok_or_else(|| {
        UpstreamError::MalformedResponse("expected a JSON object".to_string())
    })?;

    let batch = coin_ids
        .iter()
        .map(|coin_id| {
            let price = match object.get(coin_id).and_then(|entry| entry.get("usd")) {
                None => Err(UpstreamError::MalformedResponse(format!(
                    "no usd price for {}",
                    coin_id
                ))),
                Some(value) => match value.as_f64() {
                    Some(price) if price.is_finite() && price >= 0.0 => Ok(price),
                    _ => Err(UpstreamError::MalformedResponse(format!(
                        "invalid usd price for {}: {}",
                        coin_id, value
                    ))),
                },
            };
            (coin_id.clone(), price)
        })
        .collect();

    Ok(batch)
}
