mod base;
mod calculate;
mod cointracker;
mod detect;
mod enrich;
mod lots;
mod native;
mod report;
mod time;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use calculate::{calculate, CalcResult};
use detect::CsvFormat;
use enrich::CryptoCompare;
use lots::SelectionMethod;
use report::TaxReport;

struct Args {
    input: PathBuf,
    year: Option<i32>,
    method: SelectionMethod,
    enrich: bool,
    out: Option<PathBuf>,
}

fn print_usage() {
    eprintln!(
        "Usage: capgains <transactions.csv> [options]

Computes a US capital gains tax report from a CoinTracker or native
transaction CSV.

Options:
  --year <YYYY>              tax year (default: latest year with activity)
  --method <FIFO|LIFO|HIFO>  lot selection method (default: FIFO)
  --enrich                   fill missing unit prices from CryptoCompare
  --out <DIR>                also write report CSVs into DIR"
    );
}

fn parse_args() -> Result<Option<Args>> {
    let mut input = None;
    let mut year = None;
    let mut method = SelectionMethod::Fifo;
    let mut enrich = false;
    let mut out = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--year" => {
                let value = args.next().context("--year needs a value")?;
                year = Some(value.parse().context("--year must be a number")?);
            }
            "--method" => {
                let value = args.next().context("--method needs a value")?;
                method = SelectionMethod::from_str(&value)
                    .map_err(|_| anyhow::anyhow!("unknown method '{}', expected FIFO, LIFO or HIFO", value))?;
            }
            "--enrich" => enrich = true,
            "--out" => out = Some(PathBuf::from(args.next().context("--out needs a value")?)),
            other if other.starts_with('-') => bail!("unknown option '{}'", other),
            other => {
                if input.replace(PathBuf::from(other)).is_some() {
                    bail!("only one input file is supported");
                }
            }
        }
    }

    match input {
        Some(input) => Ok(Some(Args { input, year, method, enrich, out })),
        None => Ok(None),
    }
}

/// Latest UTC year with a realized event, if any.
fn default_year(result: &CalcResult) -> Option<i32> {
    result
        .disposals
        .iter()
        .map(|disposal| disposal.disposed.year())
        .chain(result.income_events.iter().map(|event| event.date.year()))
        .max()
}

fn print_report(report: &TaxReport) {
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
    for error in &report.errors {
        eprintln!("error: {}", error);
    }

    println!("Tax year {} ({})", report.year, report.method);
    println!("{:<12}{:>14}{:>14}{:>14}", "", "Gains", "Losses", "Net");
    let summary = &report.summary;
    println!(
        "{:<12}{:>14}{:>14}{:>14}",
        "Short Term",
        report::rounded_to_cent(summary.short_term_gains),
        report::rounded_to_cent(summary.short_term_losses),
        report::rounded_to_cent(summary.net_short_term()),
    );
    println!(
        "{:<12}{:>14}{:>14}{:>14}",
        "Long Term",
        report::rounded_to_cent(summary.long_term_gains),
        report::rounded_to_cent(summary.long_term_losses),
        report::rounded_to_cent(summary.net_long_term()),
    );
    println!(
        "{:<12}{:>14}{:>14}{:>14}",
        "Total", "", "",
        report::rounded_to_cent(summary.total()),
    );

    let income_total: rust_decimal::Decimal = report
        .income_events
        .iter()
        .map(|event| event.fmv_usd)
        .sum();
    println!(
        "\n{} disposal(s), {} income event(s) totaling {}, {} remaining lot(s)",
        report.rows.len(),
        report.income_events.len(),
        report::rounded_to_cent(income_total),
        report.remaining_lots.len(),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let Some(args) = parse_args()? else {
        print_usage();
        return Ok(());
    };

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let mut pre_warnings = Vec::new();

    let canonical = match detect::detect_format(&raw) {
        CsvFormat::Native => raw,
        CsvFormat::Cointracker => {
            info!("detected CoinTracker format, normalizing");
            let outcome = cointracker::normalize(&raw)?;
            pre_warnings.extend(outcome.warnings);
            outcome.csv
        }
        CsvFormat::Unknown => bail!(
            "unrecognized CSV format: expected a native header containing {:?} \
             or a CoinTracker header containing {:?}",
            detect::NATIVE_MARKER_HEADERS,
            detect::COINTRACKER_MARKER_HEADERS,
        ),
    };

    let canonical = if args.enrich {
        let oracle = CryptoCompare::new()?;
        let outcome = enrich::enrich_prices(&canonical, &oracle).await?;
        pre_warnings.extend(outcome.warnings);
        outcome.csv
    } else {
        canonical
    };

    let parsed = native::parse_native(&canonical);
    info!(
        transactions = parsed.transactions.len(),
        errors = parsed.errors.len(),
        "parsed canonical rows"
    );
    pre_warnings.extend(parsed.warnings.iter().cloned());

    let result = calculate(&parsed.transactions, args.method);
    let year = args
        .year
        .or_else(|| default_year(&result))
        .unwrap_or_else(|| Utc::now().year());

    let report = report::generate_report(&result, year, args.method, &parsed.errors, &pre_warnings);
    print_report(&report);

    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)
            .with_context(|| format!("failed to create {}", out.display()))?;
        report::export_all_to(&report, out)?;
        println!("Report CSVs written to {}", out.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Transaction, TransactionKind};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn default_year_tracks_latest_event() {
        let mut sell = Transaction::new(
            Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
            TransactionKind::Sell,
            "Coinbase",
        );
        sell.sent_asset = Some("BTC".to_owned());
        sell.sent_amount = Some(dec!(1));
        sell.sent_price_usd = Some(dec!(50000));

        let mut buy = Transaction::new(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            TransactionKind::Buy,
            "Coinbase",
        );
        buy.received_asset = Some("BTC".to_owned());
        buy.received_amount = Some(dec!(2));
        buy.received_price_usd = Some(dec!(20000));

        let result = calculate(&[buy, sell], SelectionMethod::Fifo);
        assert_eq!(default_year(&result), Some(2023));

        let empty = calculate(&[], SelectionMethod::Fifo);
        assert_eq!(default_year(&empty), None);
    }
}
