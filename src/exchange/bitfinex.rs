//! Bitfinex v2 REST adapter.
//!
//! Authenticated requests follow the v2 scheme: HMAC-SHA384 over
//! `/api{path}{nonce}{body}` with a microsecond nonce. Reads retry with
//! exponential backoff; writes swallow their errors and report `false` so
//! the planners never unwind mid-plan.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha384;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{ExchangeAdapter, ExchangeError};
use crate::domain::{Decimal, Position, PositionSide};

const RETRY_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BitfinexExchange {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BitfinexExchange {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    fn sign(&self, path: &str, nonce: &str, body: &str) -> String {
        let message = format!("/api{path}{nonce}{body}");
        let mut mac = Hmac::<Sha384>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn nonce() -> String {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        micros.to_string()
    }

    async fn post_auth(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body_json = body.to_string();
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(RETRY_BUDGET),
            ..Default::default()
        };

        retry(backoff, || async {
            let nonce = Self::nonce();
            let signature = self.sign(path, &nonce, &body_json);

            let response = self
                .client
                .post(&url)
                .header("bfx-nonce", &nonce)
                .header("bfx-apikey", &self.api_key)
                .header("bfx-signature", &signature)
                .header("content-type", "application/json")
                .body(body_json.clone())
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(ExchangeError::Network(e.to_string()))
                })?;

            let status = response.status();
            if status.as_u16() == 429 {
                return Err(backoff::Error::transient(ExchangeError::RateLimited));
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(backoff::Error::permanent(ExchangeError::Auth(format!(
                    "status {status}"
                ))));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(ExchangeError::Http {
                    status: status.as_u16(),
                    message: "server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(ExchangeError::Http {
                    status: status.as_u16(),
                    message: "client error".to_string(),
                }));
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| backoff::Error::permanent(ExchangeError::Parse(e.to_string())))
        })
        .await
    }

    async fn get_public(&self, path: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(RETRY_BUDGET),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self.client.get(&url).send().await.map_err(|e| {
                backoff::Error::transient(ExchangeError::Network(e.to_string()))
            })?;

            let status = response.status();
            if status.as_u16() == 429 {
                return Err(backoff::Error::transient(ExchangeError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(ExchangeError::Http {
                    status: status.as_u16(),
                    message: "server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(ExchangeError::Http {
                    status: status.as_u16(),
                    message: "client error".to_string(),
                }));
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| backoff::Error::permanent(ExchangeError::Parse(e.to_string())))
        })
        .await
    }

    /// True when the write response carries the "SUCCESS" status word.
    fn write_succeeded(response: &Value) -> bool {
        response
            .as_array()
            .and_then(|arr| arr.get(6))
            .and_then(Value::as_str)
            .map(|status| status == "SUCCESS")
            .unwrap_or(false)
    }
}

/// Extract a decimal from a raw array slot; null and missing read as zero.
fn decimal_at(raw: &[Value], index: usize) -> Decimal {
    raw.get(index)
        .and_then(|v| {
            if v.is_null() {
                None
            } else {
                Decimal::parse(&v.to_string()).ok()
            }
        })
        .unwrap_or(Decimal::ZERO)
}

/// Parse one row of the Bitfinex positions response.
///
/// Layout: [0] SYMBOL, [1] STATUS, [2] AMOUNT, [3] BASE_PRICE, [6] PL,
/// [9] LEVERAGE, [16] PRICE, [17] COLLATERAL.
fn parse_position(raw: &[Value]) -> Result<Position, ExchangeError> {
    let full_symbol = raw
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Parse("position row missing symbol".to_string()))?;
    let symbol = short_symbol(full_symbol);

    let amount = decimal_at(raw, 2);
    if amount.is_zero() {
        return Err(ExchangeError::Parse(format!(
            "position {symbol} has zero amount"
        )));
    }
    let side = if amount.is_positive() {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    let entry_price = decimal_at(raw, 3);
    let current_price = {
        let px = decimal_at(raw, 16);
        if px.is_zero() {
            entry_price
        } else {
            px
        }
    };
    let leverage = raw
        .get(9)
        .and_then(Value::as_f64)
        .map(|l| l as u32)
        .filter(|l| *l > 0)
        .unwrap_or(1);

    Ok(Position {
        symbol,
        side,
        quantity: amount.abs(),
        entry_price,
        current_price,
        margin: decimal_at(raw, 17),
        leverage,
        unrealized_pnl: decimal_at(raw, 6),
    })
}

/// "tBTCF0:USTF0" -> "BTC".
pub(crate) fn short_symbol(full: &str) -> String {
    full.trim_start_matches('t')
        .split("F0")
        .next()
        .unwrap_or(full)
        .to_string()
}

#[async_trait]
impl ExchangeAdapter for BitfinexExchange {
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let response = self.post_auth("/v2/auth/r/positions", json!({})).await?;
        let rows = response
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("expected positions array".to_string()))?;

        let mut positions = Vec::new();
        for row in rows {
            let Some(raw) = row.as_array() else { continue };
            let active = raw.get(1).and_then(Value::as_str) == Some("ACTIVE");
            if !active {
                continue;
            }
            match parse_position(raw) {
                Ok(position) => positions.push(position),
                Err(e) => warn!("skipping unparseable position row: {e}"),
            }
        }
        Ok(positions)
    }

    async fn available_balance(&self) -> Result<Decimal, ExchangeError> {
        let response = self.post_auth("/v2/auth/r/wallets", json!({})).await?;
        let wallets = response
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("expected wallets array".to_string()))?;

        for wallet in wallets {
            let Some(raw) = wallet.as_array() else { continue };
            let wallet_type = raw.first().and_then(Value::as_str).unwrap_or("");
            let currency = raw.get(1).and_then(Value::as_str).unwrap_or("");
            if wallet_type == "deriv" && matches!(currency, "UST" | "USDt") {
                return Ok(decimal_at(raw, 4).max(Decimal::ZERO));
            }
        }
        Ok(Decimal::ZERO)
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<f64>, ExchangeError> {
        let path = format!("/v2/candles/trade:{timeframe}:t{symbol}USD/hist?limit={limit}");
        let response = self.get_public(&path).await?;
        let rows = response
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("expected candles array".to_string()))?;

        // Row layout: [MTS, OPEN, CLOSE, HIGH, LOW, VOLUME].
        Ok(rows
            .iter()
            .filter_map(|row| row.as_array())
            .filter_map(|raw| raw.get(2).and_then(Value::as_f64))
            .collect())
    }

    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool {
        let body = json!({
            "symbol": full_symbol,
            "delta": delta.to_canonical_string(),
        });

        match self.post_auth("/v2/auth/w/deriv/collateral/set", body).await {
            Ok(response) => {
                let ok = Self::write_succeeded(&response);
                debug!(symbol = full_symbol, %delta, ok, "collateral set");
                ok
            }
            Err(e) => {
                warn!(symbol = full_symbol, %delta, "collateral set failed: {e}");
                false
            }
        }
    }

    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool {
        // The closing order is opposite to the held side.
        let amount = match side {
            PositionSide::Long => -quantity,
            PositionSide::Short => quantity,
        };
        let body = json!({
            "type": "MARKET",
            "symbol": full_symbol,
            "amount": amount.to_canonical_string(),
            "flags": 0,
        });

        match self.post_auth("/v2/auth/w/order/submit", body).await {
            Ok(response) => {
                let ok = Self::write_succeeded(&response);
                debug!(symbol = full_symbol, %amount, ok, "market close submitted");
                ok
            }
            Err(e) => {
                warn!(symbol = full_symbol, %amount, "market close failed: {e}");
                false
            }
        }
    }

    fn full_symbol(&self, symbol: &str) -> String {
        format!("t{symbol}F0:USTF0")
    }
}
