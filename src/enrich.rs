//! Missing-price enrichment from a historical daily-close oracle.
//!
//! Rows whose unit-price cells are blank get the USD daily close for their
//! calendar day, falling back one day back then one day forward. The oracle
//! is consulted at most once per ticker per run, and not at all when nothing
//! needs filling. Failures degrade to warnings; the affected prices simply
//! stay blank for the parser to judge.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::base::Diagnostic;
use crate::time;

pub(crate) type DailyCloses = HashMap<NaiveDate, Decimal>;

/// Source of historical daily USD closes.
///
/// Implementations are expected to be idempotent; the enricher calls
/// `fetch_daily_closes` no more than once per ticker per run.
pub(crate) trait PriceOracle {
    fn fetch_daily_closes<'a>(
        &'a self,
        ticker: &'a str,
        to_date: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<DailyCloses>>;
}

#[derive(Debug)]
pub(crate) struct EnrichOutcome {
    pub csv: String,
    pub filled: usize,
    pub warnings: Vec<Diagnostic>,
}

/// The `(asset column, price column)` pairs the enricher may fill.
const LEGS: [(&str, &str); 2] = [
    ("sent_asset", "sent_asset_price_usd"),
    ("received_asset", "received_asset_price_usd"),
];

/// Fill blank unit prices in a canonical CSV from `oracle`.
///
/// The original column set and order are preserved; only blank price cells on
/// non-USD legs are touched. Returns the rewritten CSV (byte-identical to the
/// input when nothing needed enrichment), the fill count, and warnings.
pub(crate) async fn enrich_prices(raw: &str, oracle: &dyn PriceOracle) -> Result<EnrichOutcome> {
    let mut outcome = EnrichOutcome {
        csv: raw.to_owned(),
        filled: 0,
        warnings: Vec::new(),
    };

    if raw.trim().is_empty() {
        return Ok(outcome);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let headers = reader.headers().context("unreadable header row")?.clone();
    let column = |name: &str| headers.iter().position(|header| header == name);
    let legs: Vec<(usize, usize)> = LEGS
        .iter()
        .filter_map(|(asset, price)| Some((column(asset)?, column(price)?)))
        .collect();
    let date_column = column("date_time");

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_owned).collect());
    }

    let blank_leg = |row: &[String], &(asset, price): &(usize, usize)| -> Option<String> {
        let ticker = row.get(asset).map(|s| s.as_str()).filter(|s| !s.is_empty())?;
        if ticker == "USD" || !row.get(price).is_some_and(|s| s.is_empty()) {
            return None;
        }
        Some(ticker.to_owned())
    };

    let mut tickers: Vec<String> = rows
        .iter()
        .flat_map(|row| legs.iter().filter_map(|leg| blank_leg(row, leg)))
        .collect();
    tickers.sort();
    tickers.dedup();

    if tickers.is_empty() {
        return Ok(outcome);
    }

    let Some(date_column) = date_column else {
        outcome
            .warnings
            .push(Diagnostic::file("no date_time column; prices not enriched"));
        return Ok(outcome);
    };

    let latest = rows
        .iter()
        .filter_map(|row| row.get(date_column))
        .filter_map(|raw| time::parse_timestamp(raw).ok())
        .map(|parsed| parsed.instant)
        .max();
    let Some(latest) = latest else {
        outcome.warnings.push(Diagnostic::file(
            "no parseable timestamps; prices not enriched",
        ));
        return Ok(outcome);
    };
    let to_date = latest + Duration::days(1);

    let mut closes: HashMap<String, DailyCloses> = HashMap::new();
    for ticker in &tickers {
        match oracle.fetch_daily_closes(ticker, to_date).await {
            Ok(fetched) => {
                let fetched: DailyCloses = fetched
                    .into_iter()
                    .filter(|(_, close)| *close > Decimal::ZERO)
                    .collect();
                if fetched.is_empty() {
                    outcome.warnings.push(Diagnostic::file(format!(
                        "no usable daily closes for {}",
                        ticker
                    )));
                } else {
                    closes.insert(ticker.clone(), fetched);
                }
            }
            Err(err) => {
                outcome.warnings.push(Diagnostic::file(format!(
                    "price lookup for {} failed: {:#}",
                    ticker, err
                )));
            }
        }
    }

    for row in &mut rows {
        let day = row
            .get(date_column)
            .and_then(|raw| time::parse_timestamp(raw).ok())
            .map(|parsed| parsed.instant.date_naive());
        let Some(day) = day else { continue };

        for leg in &legs {
            let Some(ticker) = blank_leg(row, leg) else { continue };
            let Some(daily) = closes.get(&ticker) else { continue };

            let close = lookup_around(daily, day);
            if let Some(close) = close {
                row[leg.1] = close.normalize().to_string();
                outcome.filled += 1;
            }
        }
    }

    if outcome.filled > 0 {
        info!(filled = outcome.filled, "auto-filled prices from daily closes");
        outcome.warnings.push(Diagnostic::file(format!(
            "Auto-filled {} price(s) from daily close data",
            outcome.filled
        )));
    }

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(&headers)?;
    for row in &rows {
        wtr.write_record(row)?;
    }
    outcome.csv = String::from_utf8(wtr.into_inner()?)?;

    Ok(outcome)
}

/// The row's calendar day, then one day back, then one day forward.
fn lookup_around(daily: &DailyCloses, day: NaiveDate) -> Option<Decimal> {
    [
        Some(day),
        day.checked_sub_days(Days::new(1)),
        day.checked_add_days(Days::new(1)),
    ]
    .into_iter()
    .flatten()
    .find_map(|candidate| daily.get(&candidate).copied())
}

// ============================================================================
// CryptoCompare client
// ============================================================================

/// Daily close history from CryptoCompare's `histoday` endpoint.
pub(crate) struct CryptoCompare {
    client: reqwest::Client,
    base_url: String,
}

impl CryptoCompare {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
                .build()?,
            base_url: "https://min-api.cryptocompare.com".to_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct HistoDayResponse {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Data", default)]
    data: HistoDayData,
}

#[derive(Debug, Default, Deserialize)]
struct HistoDayData {
    #[serde(rename = "Data", default)]
    points: Vec<HistoDayPoint>,
}

#[derive(Debug, Deserialize)]
struct HistoDayPoint {
    time: i64,
    close: Decimal,
}

impl PriceOracle for CryptoCompare {
    fn fetch_daily_closes<'a>(
        &'a self,
        ticker: &'a str,
        to_date: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<DailyCloses>> {
        Box::pin(async move {
            let url = format!(
                "{}/data/v2/histoday?fsym={}&tsym=USD&limit=2000&toTs={}",
                self.base_url,
                ticker,
                to_date.timestamp()
            );
            info!("Downloading {}", url);

            let response: HistoDayResponse = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("request to {} failed", url))?
                .json()
                .await
                .context("malformed histoday response")?;

            if response.response != "Success" {
                bail!("upstream error: {}", response.message);
            }
            if response.data.points.is_empty() {
                bail!("empty response");
            }

            Ok(response
                .data
                .points
                .into_iter()
                .filter_map(|point| {
                    DateTime::from_timestamp(point.time, 0)
                        .map(|when| (when.date_naive(), point.close))
                })
                .collect())
        })
    }
}
