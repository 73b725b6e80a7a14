use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// A parsed instant plus whether the source text carried an explicit offset.
///
/// Input without an offset is taken as UTC; callers attach a warning when
/// `zoned` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParsedInstant {
    pub instant: DateTime<Utc>,
    pub zoned: bool,
}

/// Parse an ISO 8601 timestamp, accepting `Z`, `±HH:MM` and `±HHMM` offsets
/// as well as naive date-times (and bare dates) that are assumed UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<ParsedInstant, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty timestamp".to_owned());
    }

    if let Ok(zoned) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ParsedInstant {
            instant: zoned.with_timezone(&Utc),
            zoned: true,
        });
    }

    // chrono's %z accepts the offset with or without a colon
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(zoned) = DateTime::parse_from_str(trimmed, format) {
            return Ok(ParsedInstant {
                instant: zoned.with_timezone(&Utc),
                zoned: true,
            });
        }
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ParsedInstant {
                instant: naive.and_utc(),
                zoned: false,
            });
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(ParsedInstant {
            instant: date.and_time(NaiveTime::MIN).and_utc(),
            zoned: false,
        });
    }

    Err(format!("unrecognized timestamp '{}'", trimmed))
}

/// Parse the `M/D/YYYY H:MM:SS` shape CoinTracker exports, UTC assumed.
/// Month, day and hour may be one or two digits.
pub(crate) fn parse_cointracker_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%m/%d/%Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Canonical `YYYY-MM-DDThh:mm:ssZ` formatting for the native schema.
pub(crate) fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// serialize function for writing DateTime<Utc> in CSV exports
pub(crate) fn serialize_date_time<S: serde::Serializer>(
    date: &DateTime<Utc>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(*date))
}
