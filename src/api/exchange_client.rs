//! Signed REST adapter for the leveraged futures account.
//!
//! Authenticated requests carry an HMAC-SHA256 signature over the query
//! string plus an `X-MBX-APIKEY` header, the scheme used by Binance-style
//! futures APIs.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::debug;

use crate::models::PositionSide;

use super::types::{ApiError, AssetBalance, OrderAck, PositionRisk, PremiumIndex};
use super::{Exchange, LivePosition, MarginMode};

pub const FUTURES_URL: &str = "https://fapi.binance.com";
pub const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Error code the venue returns when the margin mode already matches.
const ERR_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

/// Quote asset whose free balance funds new positions.
const QUOTE_ASSET: &str = "USDT";

/// Futures REST client for order execution and account reads.
pub struct FuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl FuturesClient {
    /// Create a new futures client.
    pub fn new(api_key: &str, api_secret: &str, testnet: bool) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if testnet {
            FUTURES_TESTNET_URL.to_string()
        } else {
            FUTURES_URL.to_string()
        };

        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    /// Create from `FUTURES_API_KEY` / `FUTURES_API_SECRET` environment
    /// variables. The testnet is selected by the flag or by
    /// `FUTURES_TESTNET=1`.
    pub fn from_env(testnet: bool) -> Result<Self> {
        let api_key =
            std::env::var("FUTURES_API_KEY").context("FUTURES_API_KEY not set")?;
        let api_secret =
            std::env::var("FUTURES_API_SECRET").context("FUTURES_API_SECRET not set")?;
        let testnet = testnet
            || std::env::var("FUTURES_TESTNET")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        Self::new(&api_key, &api_secret, testnet)
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| anyhow!("Invalid API secret"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));

        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn read_body(&self, response: reqwest::Response, what: &str) -> Result<String> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // Surface the venue's error code when the body carries one
            if let Ok(err) = serde_json::from_str::<ApiError>(&text) {
                bail!("{} failed: {} ({})", what, err.msg, err.code);
            }
            bail!("{} failed: {} - {}", what, status, text);
        }

        Ok(text)
    }

    async fn signed_post(&self, path: &str, params: &[(&str, String)], what: &str) -> Result<String> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);

        debug!(path = %path, "Signed POST");

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;

        self.read_body(response, what).await
    }

    async fn signed_get(&self, path: &str, params: &[(&str, String)], what: &str) -> Result<String> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;

        self.read_body(response, what).await
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "BUY",
            PositionSide::Short => "SELL",
        }
    }

    async fn position_risk(&self, symbol: &str) -> Result<Option<PositionRisk>> {
        let body = self
            .signed_get(
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
                "Position risk",
            )
            .await?;

        let rows: Vec<PositionRisk> =
            serde_json::from_str(&body).context("Failed to parse position risk")?;

        Ok(rows.into_iter().find(|r| !r.position_amt.is_zero()))
    }
}

#[async_trait]
impl Exchange for FuturesClient {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.signed_post(
            "/fapi/v1/leverage",
            &[
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
            "Set leverage",
        )
        .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        let result = self
            .signed_post(
                "/fapi/v1/marginType",
                &[
                    ("symbol", symbol.to_string()),
                    ("marginType", mode.as_str().to_string()),
                ],
                "Set margin mode",
            )
            .await;

        // Already in the requested mode is not an error
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains(&ERR_NO_NEED_TO_CHANGE_MARGIN.to_string()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<String> {
        let body = self
            .signed_post(
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", Self::order_side(side).to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.normalize().to_string()),
                ],
                "Place order",
            )
            .await?;

        let ack: OrderAck = serde_json::from_str(&body).context("Failed to parse order ack")?;
        Ok(ack.order_id.to_string())
    }

    async fn close_position(&self, symbol: &str) -> Result<String> {
        let position = self
            .position_risk(symbol)
            .await?
            .ok_or_else(|| anyhow!("No open position for {}", symbol))?;

        let side = PositionSide::from_quantity(position.position_amt)
            .ok_or_else(|| anyhow!("Flat position for {}", symbol))?;

        let body = self
            .signed_post(
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", Self::order_side(side.closing()).to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", position.position_amt.abs().normalize().to_string()),
                    ("reduceOnly", "true".to_string()),
                ],
                "Close position",
            )
            .await?;

        let ack: OrderAck = serde_json::from_str(&body).context("Failed to parse order ack")?;
        Ok(ack.order_id.to_string())
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Mark price request failed")?;

        let body = self.read_body(response, "Mark price").await?;
        let index: PremiumIndex =
            serde_json::from_str(&body).context("Failed to parse mark price")?;

        Ok(index.mark_price)
    }

    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>> {
        let Some(risk) = self.position_risk(symbol).await? else {
            return Ok(None);
        };

        let side = PositionSide::from_quantity(risk.position_amt)
            .ok_or_else(|| anyhow!("Flat position for {}", symbol))?;

        let leverage = u32::from_str(&risk.leverage.normalize().to_string()).unwrap_or(1);

        Ok(Some(LivePosition {
            symbol: risk.symbol,
            side,
            quantity: risk.position_amt.abs(),
            entry_price: risk.entry_price,
            mark_price: risk.mark_price,
            leverage,
            unrealized_pnl: risk.unrealized_profit,
        }))
    }

    async fn available_balance(&self) -> Result<Decimal> {
        let body = self
            .signed_get("/fapi/v2/balance", &[], "Account balance")
            .await?;

        let balances: Vec<AssetBalance> =
            serde_json::from_str(&body).context("Failed to parse balances")?;

        balances
            .into_iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .map(|b| b.available_balance)
            .ok_or_else(|| anyhow!("No {} balance on account", QUOTE_ASSET))
    }
}
