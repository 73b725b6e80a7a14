//! Year filtering, Schedule-D style bucketing and report export.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::base::Diagnostic;
use crate::calculate::{CalcResult, IncomeEvent};
use crate::lots::{Lot, SelectionMethod};
use crate::time::serialize_date_time;

pub(crate) fn rounded_to_cent(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One disposal, Form-8949 style.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Form8949Row {
    /// `"<amount> <asset>"`, amount to 8 decimal places with trailing zeros
    /// trimmed.
    pub description: String,
    #[serde(serialize_with = "serialize_date_time")]
    pub acquired: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date_time")]
    pub disposed: DateTime<Utc>,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub gain: Decimal,
    pub long_term: bool,
    pub days_held: i64,
}

/// The four Schedule-D buckets. Losses are stored as non-positive values so
/// every aggregate is a plain sum.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub(crate) struct ScheduleSummary {
    pub short_term_gains: Decimal,
    pub short_term_losses: Decimal,
    pub long_term_gains: Decimal,
    pub long_term_losses: Decimal,
}

impl ScheduleSummary {
    pub(crate) fn net_short_term(&self) -> Decimal {
        self.short_term_gains + self.short_term_losses
    }

    pub(crate) fn net_long_term(&self) -> Decimal {
        self.long_term_gains + self.long_term_losses
    }

    pub(crate) fn total(&self) -> Decimal {
        self.net_short_term() + self.net_long_term()
    }

    fn add(&mut self, gain: Decimal, long_term: bool) {
        match (long_term, gain >= Decimal::ZERO) {
            (false, true) => self.short_term_gains += gain,
            (false, false) => self.short_term_losses += gain,
            (true, true) => self.long_term_gains += gain,
            (true, false) => self.long_term_losses += gain,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaxReport {
    pub year: i32,
    pub method: SelectionMethod,
    pub rows: Vec<Form8949Row>,
    pub income_events: Vec<IncomeEvent>,
    pub summary: ScheduleSummary,
    /// Residual inventory, not filtered by year: the report doubles as a
    /// carry-forward snapshot.
    pub remaining_lots: Vec<Lot>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

fn describe(amount: Decimal, asset: &str) -> String {
    let trimmed = amount
        .round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    format!("{} {}", trimmed, asset)
}

/// Filter realized events to `year` (by each event's own UTC date) and bucket
/// the gains. Pre-existing diagnostics from parsing or enrichment are merged
/// ahead of the calculator's own.
pub(crate) fn generate_report(
    result: &CalcResult,
    year: i32,
    method: SelectionMethod,
    pre_errors: &[Diagnostic],
    pre_warnings: &[Diagnostic],
) -> TaxReport {
    let mut summary = ScheduleSummary::default();
    let mut rows = Vec::new();

    for disposal in &result.disposals {
        if disposal.disposed.year() != year {
            continue;
        }
        summary.add(disposal.gain, disposal.long_term);
        rows.push(Form8949Row {
            description: describe(disposal.amount, &disposal.asset),
            acquired: disposal.acquired,
            disposed: disposal.disposed,
            proceeds: disposal.proceeds,
            cost_basis: disposal.cost_basis,
            gain: disposal.gain,
            long_term: disposal.long_term,
            days_held: disposal.days_held,
        });
    }

    let income_events = result
        .income_events
        .iter()
        .filter(|event| event.date.year() == year)
        .cloned()
        .collect();

    let mut errors = pre_errors.to_vec();
    errors.extend(result.errors.iter().cloned());
    let mut warnings = pre_warnings.to_vec();
    warnings.extend(result.warnings.iter().cloned());

    TaxReport {
        year,
        method,
        rows,
        income_events,
        summary,
        remaining_lots: result.remaining_lots.clone(),
        errors,
        warnings,
    }
}

// ============================================================================
// CSV export
// ============================================================================

pub(crate) fn save_form8949_to_csv(report: &TaxReport, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    #[derive(Serialize)]
    struct CsvRow<'a> {
        #[serde(rename = "Description")]
        description: &'a str,
        #[serde(rename = "Date Acquired", serialize_with = "serialize_date_time")]
        acquired: DateTime<Utc>,
        #[serde(rename = "Date Sold", serialize_with = "serialize_date_time")]
        disposed: DateTime<Utc>,
        #[serde(rename = "Proceeds")]
        proceeds: Decimal,
        #[serde(rename = "Cost Basis")]
        cost_basis: Decimal,
        #[serde(rename = "Gain or Loss")]
        gain: Decimal,
        #[serde(rename = "Long Term")]
        long_term: bool,
        #[serde(rename = "Days Held")]
        days_held: i64,
    }

    for row in &report.rows {
        wtr.serialize(CsvRow {
            description: &row.description,
            acquired: row.acquired,
            disposed: row.disposed,
            proceeds: rounded_to_cent(row.proceeds),
            cost_basis: rounded_to_cent(row.cost_basis),
            gain: rounded_to_cent(row.gain),
            long_term: row.long_term,
            days_held: row.days_held,
        })?;
    }

    Ok(())
}

pub(crate) fn save_summary_to_csv(report: &TaxReport, output_path: &Path) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(output_path)?;

    let summary = &report.summary;
    wtr.write_record([
        format!("Tax year {}", report.year).as_str(),
        "Gains",
        "Losses",
        "Net",
    ])?;
    wtr.write_record([
        "Short Term",
        rounded_to_cent(summary.short_term_gains).to_string().as_str(),
        rounded_to_cent(summary.short_term_losses).to_string().as_str(),
        rounded_to_cent(summary.net_short_term()).to_string().as_str(),
    ])?;
    wtr.write_record([
        "Long Term",
        rounded_to_cent(summary.long_term_gains).to_string().as_str(),
        rounded_to_cent(summary.long_term_losses).to_string().as_str(),
        rounded_to_cent(summary.net_long_term()).to_string().as_str(),
    ])?;
    wtr.write_record([
        "Total",
        "",
        "",
        rounded_to_cent(summary.total()).to_string().as_str(),
    ])?;

    Ok(())
}

pub(crate) fn save_income_to_csv(report: &TaxReport, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    #[derive(Serialize)]
    struct CsvIncome<'a> {
        #[serde(rename = "Date", serialize_with = "serialize_date_time")]
        date: DateTime<Utc>,
        #[serde(rename = "Type")]
        kind: String,
        #[serde(rename = "Asset")]
        asset: &'a str,
        #[serde(rename = "Amount")]
        amount: Decimal,
        #[serde(rename = "Fair Market Value")]
        fmv_usd: Decimal,
        #[serde(rename = "Wallet")]
        wallet: &'a str,
    }

    for event in &report.income_events {
        wtr.serialize(CsvIncome {
            date: event.date,
            kind: event.kind.to_string(),
            asset: &event.asset,
            amount: event.amount,
            fmv_usd: rounded_to_cent(event.fmv_usd),
            wallet: &event.wallet,
        })?;
    }

    Ok(())
}

pub(crate) fn save_remaining_lots_to_csv(report: &TaxReport, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    #[derive(Serialize)]
    struct CsvLot<'a> {
        #[serde(rename = "Wallet")]
        wallet: &'a str,
        #[serde(rename = "Asset")]
        asset: &'a str,
        #[serde(rename = "Remaining")]
        remaining: Decimal,
        #[serde(rename = "Cost Basis Per Unit")]
        basis_per_unit: Decimal,
        #[serde(rename = "Acquired", serialize_with = "serialize_date_time")]
        acquired: DateTime<Utc>,
        #[serde(rename = "Acquired As")]
        acquired_as: String,
    }

    for lot in &report.remaining_lots {
        wtr.serialize(CsvLot {
            wallet: &lot.wallet,
            asset: &lot.asset,
            remaining: lot.remaining,
            basis_per_unit: lot.basis_per_unit,
            acquired: lot.acquired,
            acquired_as: lot.acquired_as.to_string(),
        })?;
    }

    Ok(())
}

/// Write the full report set into `output_path`.
pub(crate) fn export_all_to(report: &TaxReport, output_path: &Path) -> Result<()> {
    save_form8949_to_csv(report, &output_path.join(format!("{}_form8949.csv", report.year)))?;
    save_summary_to_csv(report, &output_path.join(format!("{}_schedule_d.csv", report.year)))?;
    save_income_to_csv(report, &output_path.join(format!("{}_income.csv", report.year)))?;
    save_remaining_lots_to_csv(report, &output_path.join("remaining_lots.csv"))?;
    Ok(())
}
