// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — Exchange Gateway
//
//   - Typed wire models shared across the engine
//   - GatewayError taxonomy with a recovery policy per kind
//   - ExchangeClient trait (one instance per account, single-writer)
//   - LiveExchange: REST client with session reauth-once-on-401
//   - SimExchange: in-memory double for the engine tests
//
// Every placement this gateway emits is a post-only good-till-time limit
// order with a locally assigned numeric client id. The venue may ack with an
// all-zero order id; callers align the real id later by client id.
// ─────────────────────────────────────────────────────────────────────────────
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::signing::sign_request;

// ─── Shared Models ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Account {
    A,
    B,
}

impl Account {
    pub fn other(self) -> Self {
        match self {
            Account::A => Account::B,
            Account::B => Account::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Account::A => "A",
            Account::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A pair of values indexed by account. Keeps A/B symmetric code branch-free.
#[derive(Debug, Clone, Default)]
pub struct PerAccount<T> {
    pub a: T,
    pub b: T,
}

impl<T> PerAccount<T> {
    pub fn get(&self, account: Account) -> &T {
        match account {
            Account::A => &self.a,
            Account::B => &self.b,
        }
    }

    pub fn get_mut(&mut self, account: Account) -> &mut T {
        match account {
            Account::A => &mut self.a,
            Account::B => &mut self.b,
        }
    }

    pub fn split_mut(&mut self) -> (&mut T, &mut T) {
        (&mut self.a, &mut self.b)
    }
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub instrument: String,
    /// Signed size in base units, positive = long.
    pub signed_base: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

impl PositionInfo {
    pub fn abs_notional(&self) -> f64 {
        self.signed_base.abs() * self.entry_price
    }
}

/// The exchange's view of one resting order, as returned by `open_orders`.
#[derive(Debug, Clone)]
pub struct OpenOrderView {
    pub order_id: String,
    pub client_id: Option<u64>,
    pub instrument: String,
    pub side: Side,
    pub limit_price: f64,
    pub size: f64,
    pub traded: f64,
    pub post_only: bool,
    pub created_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccountSummary {
    pub equity: f64,
    pub maintenance_margin: f64,
    pub available_balance: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BookTop {
    pub bid1: f64,
    pub ask1: f64,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InstrumentMeta {
    pub tick_size: f64,
    pub min_size: f64,
    pub base_decimals: u32,
}

/// Order id the venue returns before the matching engine has assigned a real
/// one. Treated as "unknown, align by client id later".
pub fn is_sentinel_order_id(id: &str) -> bool {
    id.is_empty() || id.chars().all(|c| c == '0')
}

// ─── Error Taxonomy ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Session could not be (re)established. Gateway already retried once.
    Auth(String),
    /// The order would have crossed the book.
    PostOnlyRejected,
    /// Size below the instrument minimum after rounding.
    InsufficientSize(String),
    RateLimited,
    /// Network error, timeout, or 5xx. Safe to retry next tick.
    Transient(String),
    /// Semantic 4xx. Retrying the same request will not help.
    Permanent(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Auth(s) => write!(f, "Auth failure: {}", s),
            GatewayError::PostOnlyRejected => write!(f, "Post-only rejected"),
            GatewayError::InsufficientSize(s) => write!(f, "Insufficient size: {}", s),
            GatewayError::RateLimited => write!(f, "Rate limited (429)"),
            GatewayError::Transient(s) => write!(f, "Transient error: {}", s),
            GatewayError::Permanent(s) => write!(f, "Permanent error: {}", s),
        }
    }
}

// ─── Exchange Trait ────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn positions(&mut self) -> Result<Vec<PositionInfo>, GatewayError>;
    async fn open_orders(&mut self) -> Result<Vec<OpenOrderView>, GatewayError>;
    async fn account_summary(&mut self) -> Result<AccountSummary, GatewayError>;
    async fn book_top(&mut self, instrument: &str, depth: u32) -> Result<BookTop, GatewayError>;
    async fn instrument_meta(&mut self, instrument: &str)
        -> Result<InstrumentMeta, GatewayError>;

    /// Places a post-only good-till-time limit order. Returns the exchange
    /// order id, which may be the all-zero sentinel.
    async fn place_post_only(
        &mut self,
        instrument: &str,
        side: Side,
        price: f64,
        size: f64,
        client_id: u64,
    ) -> Result<String, GatewayError>;

    async fn cancel(&mut self, instrument: &str, order_id: &str) -> Result<(), GatewayError>;

    // For engine tests only
    fn as_sim_mut(&mut self) -> Option<&mut SimExchange> {
        None
    }
}

// ─── Credentials ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    /// Hex-encoded HMAC signing key.
    pub signing_key: String,
    pub account_id: String,
    /// Funding/main account the sub-account hangs off; required by the
    /// session endpoint.
    pub main_account_id: String,
}

// ─── Live Exchange ─────────────────────────────────────────────────

const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct LiveExchange {
    pub base_url: String,
    creds: Credentials,
    client: reqwest::Client,
    session_token: Option<String>,
}

impl LiveExchange {
    pub fn new(base_url: String, creds: Credentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url, creds, client, session_token: None }
    }

    /// Establishes a session token. Called lazily and again after a 401.
    async fn login(&mut self) -> Result<(), GatewayError> {
        let ts = chrono::Utc::now().timestamp_millis() as u64;
        let body = serde_json::json!({
            "api_key": self.creds.api_key,
            "account_id": self.creds.account_id,
            "main_account_id": self.creds.main_account_id,
        })
        .to_string();
        let sig = sign_request(&self.creds.signing_key, ts, "POST", "/auth/session", &body)
            .map_err(|e| GatewayError::Auth(e.to_string()))?;

        let resp = self
            .client
            .post(format!("{}/auth/session", self.base_url))
            .header("X-Api-Key", &self.creds.api_key)
            .header("X-Timestamp", ts)
            .header("X-Signature", sig)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Auth(format!("session status {}", resp.status())));
        }
        let data: serde_json::Value =
            resp.json().await.map_err(|e| GatewayError::Transient(e.to_string()))?;
        match data["token"].as_str() {
            Some(t) if !t.is_empty() => {
                self.session_token = Some(t.to_string());
                log::info!("[GATEWAY {}] Session established.", self.creds.account_id);
                Ok(())
            }
            _ => Err(GatewayError::Auth("session response had no token".to_string())),
        }
    }

    /// Signs and sends one request. On 401 the session is rebuilt once and the
    /// call retried; a second 401 surfaces as Auth.
    async fn request(
        &mut self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        if self.session_token.is_none() {
            self.login().await?;
        }
        match self.request_once(method, path, body.as_ref()).await {
            Err(GatewayError::Auth(_)) => {
                log::warn!(
                    "[GATEWAY {}] 401 on {} {}. Rebuilding session once.",
                    self.creds.account_id, method, path
                );
                self.session_token = None;
                self.login().await?;
                self.request_once(method, path, body.as_ref()).await
            }
            other => other,
        }
    }

    async fn request_once(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let ts = chrono::Utc::now().timestamp_millis() as u64;
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = sign_request(&self.creds.signing_key, ts, method, path, &body_str)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = match method {
            "GET" => self.client.get(&url),
            _ => self.client.post(&url).body(body_str.clone()),
        };
        req = req
            .header("X-Api-Key", &self.creds.api_key)
            .header("X-Timestamp", ts)
            .header("X-Signature", sig)
            .header("Content-Type", "application/json");
        if let Some(token) = &self.session_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await.map_err(|e| GatewayError::Transient(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| GatewayError::Transient(e.to_string()))?;

        match status.as_u16() {
            401 => return Err(GatewayError::Auth(format!("401 on {}", path))),
            429 => return Err(GatewayError::RateLimited),
            s if s >= 500 => return Err(GatewayError::Transient(format!("{}: {}", s, text))),
            _ => {}
        }

        let data: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Transient(format!("bad json: {}", e)))?;

        if !status.is_success() {
            return Err(classify_api_error(&data, status.as_u16()));
        }
        // Some venues return 200 with an error envelope.
        if data["code"].as_str().is_some() && data["code"].as_str() != Some("OK") {
            return Err(classify_api_error(&data, status.as_u16()));
        }
        Ok(data)
    }
}

/// Maps a structured error body onto the taxonomy. Unrecognised 4xx payloads
/// are Permanent: retrying the identical request cannot succeed.
fn classify_api_error(data: &serde_json::Value, status: u16) -> GatewayError {
    let code = data["code"].as_str().unwrap_or("");
    let msg = data["message"].as_str().unwrap_or("").to_string();
    match code {
        "POST_ONLY_WOULD_TRADE" => GatewayError::PostOnlyRejected,
        "SIZE_BELOW_MIN" => GatewayError::InsufficientSize(msg),
        "RATE_LIMITED" => GatewayError::RateLimited,
        _ if status == 429 => GatewayError::RateLimited,
        _ if status >= 500 => GatewayError::Transient(format!("{}: {}", status, msg)),
        _ => GatewayError::Permanent(format!("{} {}: {}", status, code, msg)),
    }
}

fn f64_field(v: &serde_json::Value) -> f64 {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
        .unwrap_or(0.0)
}

fn side_field(v: &serde_json::Value) -> Side {
    match v.as_str().unwrap_or("") {
        "sell" | "SELL" => Side::Sell,
        _ => Side::Buy,
    }
}

#[async_trait]
impl ExchangeClient for LiveExchange {
    async fn positions(&mut self) -> Result<Vec<PositionInfo>, GatewayError> {
        let path = format!("/positions?account_id={}", self.creds.account_id);
        let data = self.request("GET", &path, None).await?;
        let mut out = Vec::new();
        if let Some(arr) = data["positions"].as_array() {
            for p in arr {
                let signed_base = f64_field(&p["size"]);
                if signed_base.abs() < 1e-12 {
                    continue;
                }
                out.push(PositionInfo {
                    instrument: p["instrument"].as_str().unwrap_or("").to_string(),
                    signed_base,
                    entry_price: f64_field(&p["entry_price"]),
                    mark_price: f64_field(&p["mark_price"]),
                });
            }
        }
        Ok(out)
    }

    async fn open_orders(&mut self) -> Result<Vec<OpenOrderView>, GatewayError> {
        let path = format!("/orders/open?account_id={}", self.creds.account_id);
        let data = self.request("GET", &path, None).await?;
        let mut out = Vec::new();
        if let Some(arr) = data["orders"].as_array() {
            for o in arr {
                out.push(OpenOrderView {
                    order_id: o["order_id"].as_str().unwrap_or("").to_string(),
                    client_id: o["client_order_id"]
                        .as_u64()
                        .or_else(|| o["client_order_id"].as_str().and_then(|s| s.parse().ok())),
                    instrument: o["instrument"].as_str().unwrap_or("").to_string(),
                    side: side_field(&o["side"]),
                    limit_price: f64_field(&o["limit_price"]),
                    size: f64_field(&o["size"]),
                    traded: f64_field(&o["traded_size"]),
                    post_only: o["post_only"].as_bool().unwrap_or(false),
                    created_ms: o["create_time_ms"].as_u64().unwrap_or(0),
                });
            }
        }
        Ok(out)
    }

    async fn account_summary(&mut self) -> Result<AccountSummary, GatewayError> {
        let path = format!("/account/summary?account_id={}", self.creds.account_id);
        let data = self.request("GET", &path, None).await?;
        Ok(AccountSummary {
            equity: f64_field(&data["equity"]),
            maintenance_margin: f64_field(&data["maintenance_margin"]),
            available_balance: f64_field(&data["available_balance"]),
        })
    }

    async fn book_top(&mut self, instrument: &str, depth: u32) -> Result<BookTop, GatewayError> {
        let path = format!("/book?instrument={}&depth={}", instrument, depth);
        let data = self.request("GET", &path, None).await?;
        let bid1 = data["bids"]
            .as_array()
            .and_then(|b| b.first())
            .map(|lvl| f64_field(&lvl["price"]))
            .unwrap_or(0.0);
        let ask1 = data["asks"]
            .as_array()
            .and_then(|a| a.first())
            .map(|lvl| f64_field(&lvl["price"]))
            .unwrap_or(0.0);
        if bid1 <= 0.0 || ask1 <= 0.0 {
            return Err(GatewayError::Transient(format!("empty book for {}", instrument)));
        }
        Ok(BookTop { bid1, ask1, ts_ms: data["ts_ms"].as_u64().unwrap_or(0) })
    }

    async fn instrument_meta(
        &mut self,
        instrument: &str,
    ) -> Result<InstrumentMeta, GatewayError> {
        let path = format!("/instruments/{}", instrument);
        let data = self.request("GET", &path, None).await?;
        let tick_size = f64_field(&data["tick_size"]);
        let min_size = f64_field(&data["min_size"]);
        if tick_size <= 0.0 || min_size <= 0.0 {
            return Err(GatewayError::Permanent(format!(
                "instrument {} has no tradable metadata",
                instrument
            )));
        }
        Ok(InstrumentMeta {
            tick_size,
            min_size,
            base_decimals: data["base_decimals"].as_u64().unwrap_or(8) as u32,
        })
    }

    async fn place_post_only(
        &mut self,
        instrument: &str,
        side: Side,
        price: f64,
        size: f64,
        client_id: u64,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "account_id": self.creds.account_id,
            "instrument": instrument,
            "side": side.label(),
            "order_type": "limit",
            "time_in_force": "GOOD_TILL_TIME",
            "post_only": true,
            "limit_price": format_price(price),
            "size": format_price(size),
            "client_order_id": client_id,
        });
        let data = self.request("POST", "/orders", Some(body)).await?;
        Ok(data["order_id"].as_str().unwrap_or("").to_string())
    }

    async fn cancel(&mut self, instrument: &str, order_id: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "account_id": self.creds.account_id,
            "instrument": instrument,
            "order_id": order_id,
        });
        self.request("POST", "/orders/cancel", Some(body)).await?;
        Ok(())
    }
}

// ─── Sim Exchange (In-Memory) ──────────────────────────────────────

/// Record of one accepted placement, for test assertions.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub client_id: u64,
    pub order_id: String,
}

#[derive(Default)]
pub struct SimExchange {
    pub positions: Vec<PositionInfo>,
    pub orders: Vec<OpenOrderView>,
    pub summary: AccountSummary,
    pub books: HashMap<String, BookTop>,
    pub metas: HashMap<String, InstrumentMeta>,
    /// The next N placements come back PostOnlyRejected.
    pub post_only_rejects: u32,
    /// When set, placements ack with the all-zero sentinel id.
    pub ack_with_sentinel: bool,
    pub placed: Vec<PlacedOrder>,
    pub cancelled: Vec<String>,
    next_oid: u64,
}

impl SimExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_book(&mut self, instrument: &str, bid1: f64, ask1: f64) {
        self.books.insert(instrument.to_string(), BookTop { bid1, ask1, ts_ms: 0 });
    }

    pub fn set_meta(&mut self, instrument: &str, tick_size: f64, min_size: f64, base_decimals: u32) {
        self.metas.insert(
            instrument.to_string(),
            InstrumentMeta { tick_size, min_size, base_decimals },
        );
    }

    pub fn set_position(&mut self, instrument: &str, signed_base: f64, entry_price: f64) {
        self.positions.retain(|p| p.instrument != instrument);
        if signed_base.abs() > 1e-12 {
            self.positions.push(PositionInfo {
                instrument: instrument.to_string(),
                signed_base,
                entry_price,
                mark_price: entry_price,
            });
        }
    }

    /// Marks traded progress on a resting order, as the venue would report it.
    pub fn fill_order(&mut self, order_id: &str, traded: f64) {
        if let Some(o) = self.orders.iter_mut().find(|o| o.order_id == order_id) {
            o.traded = traded.min(o.size);
        }
    }

    pub fn remove_order(&mut self, order_id: &str) {
        self.orders.retain(|o| o.order_id != order_id);
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn positions(&mut self) -> Result<Vec<PositionInfo>, GatewayError> {
        Ok(self.positions.clone())
    }

    async fn open_orders(&mut self) -> Result<Vec<OpenOrderView>, GatewayError> {
        Ok(self.orders.clone())
    }

    async fn account_summary(&mut self) -> Result<AccountSummary, GatewayError> {
        Ok(self.summary)
    }

    async fn book_top(&mut self, instrument: &str, _depth: u32) -> Result<BookTop, GatewayError> {
        self.books
            .get(instrument)
            .copied()
            .ok_or_else(|| GatewayError::Transient(format!("no sim book for {}", instrument)))
    }

    async fn instrument_meta(
        &mut self,
        instrument: &str,
    ) -> Result<InstrumentMeta, GatewayError> {
        self.metas
            .get(instrument)
            .copied()
            .ok_or_else(|| GatewayError::Permanent(format!("no sim meta for {}", instrument)))
    }

    async fn place_post_only(
        &mut self,
        instrument: &str,
        side: Side,
        price: f64,
        size: f64,
        client_id: u64,
    ) -> Result<String, GatewayError> {
        if self.post_only_rejects > 0 {
            self.post_only_rejects -= 1;
            return Err(GatewayError::PostOnlyRejected);
        }
        self.next_oid += 1;
        let order_id = if self.ack_with_sentinel {
            "0".repeat(16)
        } else {
            format!("sim-{}", self.next_oid)
        };
        let resting_id = if self.ack_with_sentinel {
            format!("real-{}", self.next_oid)
        } else {
            order_id.clone()
        };
        self.orders.push(OpenOrderView {
            order_id: resting_id,
            client_id: Some(client_id),
            instrument: instrument.to_string(),
            side,
            limit_price: price,
            size,
            traded: 0.0,
            post_only: true,
            created_ms: 0,
        });
        self.placed.push(PlacedOrder {
            instrument: instrument.to_string(),
            side,
            price,
            size,
            client_id,
            order_id: order_id.clone(),
        });
        Ok(order_id)
    }

    async fn cancel(&mut self, _instrument: &str, order_id: &str) -> Result<(), GatewayError> {
        self.orders.retain(|o| o.order_id != order_id);
        self.cancelled.push(order_id.to_string());
        Ok(())
    }

    fn as_sim_mut(&mut self) -> Option<&mut SimExchange> {
        Some(self)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Wire format for prices and sizes: fixed precision, trailing zeros
/// stripped.
pub fn format_price(x: f64) -> String {
    let s = format!("{:.10}", x);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
