//! Bybit v5 kline provider.
//!
//! One call to `GET /v5/market/kline` per page. Handles status classification,
//! retries with jittered exponential backoff, row normalization, and the
//! newest-first ordering Bybit uses.
//!
//! Row layout: `[startMs, open, high, low, close, volume, turnover]`; only the
//! first five fields are read. Values arrive as strings.

use super::provider::{FetchError, Page, PageSource};
use super::retry::RetryPolicy;
use super::transport::{HttpReply, HttpTransport, ReqwestTransport};
use crate::config::UpstreamConfig;
use crate::domain::{Bar, Interval};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Bybit caps `limit` at 1000 rows per call.
pub const MAX_LIMIT: usize = 1000;

/// Rate limit exceeded.
const RET_CODE_RATE_LIMIT: i64 = 10006;
/// Server-side timeout / internal error.
const RET_CODE_SERVICE_ERROR: i64 = 10016;
/// Longest `Retry-After` honored; anything beyond waits for the next tick.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode", default)]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<Value>>,
}

/// How a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    Permanent { status: u16, message: String },
}

impl AttemptError {
    fn transient(message: String) -> Self {
        AttemptError::Transient {
            message,
            retry_after: None,
        }
    }
}

/// Backoff after the `attempt`-th failure, never shorter than the server's
/// `Retry-After` (capped at [`MAX_RETRY_AFTER`]).
fn backoff(retry: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let floor = retry_after.map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER));
    retry.delay_for(attempt).max(floor)
}

/// Why a row was dropped.
#[derive(Debug, PartialEq)]
enum RowError {
    TooShort(usize),
    Field(&'static str),
    NonFinite,
    /// High below low, or open/close outside the high-low range.
    Inconsistent,
    Misaligned(i64),
}

/// Bybit market data client.
pub struct BybitClient<T = ReqwestTransport> {
    transport: T,
    base_url: String,
    category: String,
    retry: RetryPolicy,
}

impl BybitClient<ReqwestTransport> {
    /// Build a client backed by a blocking `reqwest` transport.
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let transport = ReqwestTransport::new(Duration::from_secs(cfg.timeout_secs))?;
        Ok(Self::with_transport(transport, cfg))
    }
}

impl<T: HttpTransport> BybitClient<T> {
    pub fn with_transport(transport: T, cfg: &UpstreamConfig) -> Self {
        Self {
            transport,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            category: cfg.category.clone(),
            retry: cfg.retry_policy(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn kline_url(&self) -> String {
        format!("{}/v5/market/kline", self.base_url)
    }

    /// One HTTP exchange, classified.
    fn attempt(
        &self,
        url: &str,
        query: &[(&str, String)],
        interval: Interval,
    ) -> Result<(Vec<Bar>, usize), AttemptError> {
        let reply = self
            .transport
            .get(url, query)
            .map_err(|e| AttemptError::transient(e.to_string()))?;

        classify_status(&reply)?;

        let parsed: KlineResponse = serde_json::from_str(&reply.body)
            .map_err(|e| AttemptError::transient(format!("unparseable body: {e}")))?;

        match parsed.ret_code {
            0 => {}
            RET_CODE_RATE_LIMIT | RET_CODE_SERVICE_ERROR => {
                return Err(AttemptError::Transient {
                    message: format!("retCode {}: {}", parsed.ret_code, parsed.ret_msg),
                    retry_after: reply.retry_after,
                });
            }
            code => {
                return Err(AttemptError::Permanent {
                    status: reply.status,
                    message: format!("retCode {code}: {}", parsed.ret_msg),
                });
            }
        }

        let rows = parsed.result.map(|r| r.list).unwrap_or_default();
        Ok(normalize_rows(&rows, interval))
    }
}

impl<T: HttpTransport> PageSource for BybitClient<T> {
    fn name(&self) -> &str {
        "bybit"
    }

    fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Page, FetchError> {
        if start_ms > end_ms {
            return Err(FetchError::InvalidRequest(format!(
                "start {start_ms} is after end {end_ms}"
            )));
        }

        let url = self.kline_url();
        let query = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
            ("interval", interval.code().to_string()),
            ("start", start_ms.to_string()),
            ("end", end_ms.to_string()),
            ("limit", limit.clamp(1, MAX_LIMIT).to_string()),
        ];

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.attempt(&url, &query, interval) {
                Ok((bars, dropped)) => {
                    if dropped > 0 {
                        warn!(symbol, %interval, dropped, "dropped malformed kline rows");
                    }
                    debug!(symbol, %interval, start_ms, end_ms, rows = bars.len(), attempt, "kline page");
                    return Ok(Page {
                        bars,
                        attempts: attempt,
                        dropped,
                    });
                }
                Err(AttemptError::Permanent { status, message }) => {
                    return Err(FetchError::Permanent {
                        symbol: symbol.to_string(),
                        status,
                        message,
                    });
                }
                Err(AttemptError::Transient {
                    message,
                    retry_after,
                }) => {
                    warn!(symbol, %interval, attempt, error = %message, ?retry_after, "transient upstream failure");
                    last_error = message;
                    if attempt < self.retry.max_attempts {
                        std::thread::sleep(backoff(&self.retry, attempt, retry_after));
                    }
                }
            }
        }

        Err(FetchError::Retryable {
            symbol: symbol.to_string(),
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

fn classify_status(reply: &HttpReply) -> Result<(), AttemptError> {
    match reply.status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(AttemptError::Transient {
            message: format!("HTTP {}: {}", reply.status, snippet(&reply.body)),
            retry_after: reply.retry_after,
        }),
        status => Err(AttemptError::Permanent {
            status,
            message: snippet(&reply.body),
        }),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Parse rows into ascending bars, dropping malformed ones.
fn normalize_rows(rows: &[Vec<Value>], interval: Interval) -> (Vec<Bar>, usize) {
    let mut bars = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        match parse_row(row, interval) {
            Ok(bar) => bars.push(bar),
            Err(reason) => {
                debug!(?reason, ?row, "malformed kline row");
                dropped += 1;
            }
        }
    }
    bars.sort_by_key(|b| b.timestamp);
    (bars, dropped)
}

fn parse_row(row: &[Value], interval: Interval) -> Result<Bar, RowError> {
    if row.len() < 5 {
        return Err(RowError::TooShort(row.len()));
    }
    let start_ms = as_i64(&row[0]).ok_or(RowError::Field("start"))?;
    if start_ms < 0 {
        return Err(RowError::Field("start"));
    }
    if start_ms % interval.step_ms() != 0 {
        return Err(RowError::Misaligned(start_ms));
    }

    let bar = Bar {
        timestamp: start_ms / 1000,
        open: as_f64(&row[1]).ok_or(RowError::Field("open"))?,
        high: as_f64(&row[2]).ok_or(RowError::Field("high"))?,
        low: as_f64(&row[3]).ok_or(RowError::Field("low"))?,
        close: as_f64(&row[4]).ok_or(RowError::Field("close"))?,
    };
    if !bar.is_finite() {
        return Err(RowError::NonFinite);
    }
    if !bar.is_sane() {
        return Err(RowError::Inconsistent);
    }
    Ok(bar)
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
