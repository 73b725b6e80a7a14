/// CSV dialects the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CsvFormat {
    Native,
    Cointracker,
    Unknown,
}

pub(crate) const NATIVE_MARKER_HEADERS: &[&str] =
    &["date_time", "transaction_type", "wallet_or_exchange"];

pub(crate) const COINTRACKER_MARKER_HEADERS: &[&str] = &[
    "Date",
    "Type",
    "Received Quantity",
    "Received Currency",
    "Received Cost Basis (USD)",
    "Sent Quantity",
    "Sent Currency",
];

/// Classify raw CSV text from its header row alone.
///
/// The first non-empty line is split on commas and each cell trimmed; the
/// format whose marker headers are all present wins, native checked first.
/// No data row is inspected.
pub(crate) fn detect_format(raw: &str) -> CsvFormat {
    let Some(header_line) = raw.lines().find(|line| !line.trim().is_empty()) else {
        return CsvFormat::Unknown;
    };

    let headers: Vec<&str> = header_line
        .split(',')
        .map(|cell| cell.trim().trim_matches('"'))
        .collect();

    let has_all = |markers: &[&str]| markers.iter().all(|marker| headers.contains(marker));

    if has_all(NATIVE_MARKER_HEADERS) {
        CsvFormat::Native
    } else if has_all(COINTRACKER_MARKER_HEADERS) {
        CsvFormat::Cointracker
    } else {
        CsvFormat::Unknown
    }
}
