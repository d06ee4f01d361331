// =============================================================================
// Canonical resolutions
// =============================================================================
//
// The chart speaks its own resolution vocabulary ("1", "60", "1D", "12M");
// exchanges speak native timeframes ("1m", "1h", "1d", "1y"). Each exchange
// handle carries a table built by mapping every native timeframe it reports
// through `TIMEFRAME_MAPPING`; timeframes with no canonical entry are skipped.
//
// Live bar aggregation additionally needs the interval length. Timeframes
// missing from `INTERVAL_SECONDS` support historical fetch only.
// =============================================================================

/// Native timeframe -> canonical resolution, in canonical display order.
pub const TIMEFRAME_MAPPING: &[(&str, &str)] = &[
    ("1s", "1S"),
    ("3s", "3S"),
    ("5s", "5S"),
    ("10s", "10S"),
    ("15s", "15S"),
    ("30s", "30S"),
    ("45s", "45S"),
    ("1m", "1"),
    ("3m", "3"),
    ("5m", "5"),
    ("10m", "10"),
    ("15m", "15"),
    ("30m", "30"),
    ("45m", "45"),
    ("1h", "60"),
    ("2h", "120"),
    ("3h", "180"),
    ("4h", "240"),
    ("6h", "360"),
    ("8h", "480"),
    ("12h", "720"),
    ("1d", "1D"),
    ("3d", "3D"),
    ("5d", "5D"),
    ("7d", "7D"),
    ("1w", "1W"),
    ("2w", "2W"),
    ("1M", "1M"),
    ("3M", "3M"),
    ("4M", "4M"),
    ("6M", "6M"),
    ("1y", "12M"),
];

/// Native timeframe -> interval length in seconds, for live bar boundaries.
const INTERVAL_SECONDS: &[(&str, i64)] = &[
    ("1m", 60),
    ("3m", 3 * 60),
    ("5m", 5 * 60),
    ("15m", 15 * 60),
    ("30m", 30 * 60),
    ("1h", 60 * 60),
    ("2h", 120 * 60),
    ("4h", 240 * 60),
    ("6h", 360 * 60),
    ("8h", 480 * 60),
    ("12h", 720 * 60),
    ("1d", 1440 * 60),
    ("3d", 4320 * 60),
    ("1w", 10080 * 60),
    ("1M", 45360 * 60),
];

/// Interval length in milliseconds, when live aggregation is supported.
pub fn interval_ms(timeframe: &str) -> Option<i64> {
    INTERVAL_SECONDS
        .iter()
        .find(|(native, _)| *native == timeframe)
        .map(|(_, secs)| secs * 1000)
}

/// Canonical <-> native mapping for one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTable {
    /// `(canonical, native)` pairs in canonical display order.
    entries: Vec<(String, String)>,
}

impl ResolutionTable {
    /// Build the table from the native timeframes an exchange reports.
    pub fn from_timeframes<S: AsRef<str>>(timeframes: &[S]) -> Self {
        let entries = TIMEFRAME_MAPPING
            .iter()
            .filter(|(native, _)| timeframes.iter().any(|tf| tf.as_ref() == *native))
            .map(|(native, canonical)| (canonical.to_string(), native.to_string()))
            .collect();
        Self { entries }
    }

    /// Native timeframe for a canonical resolution.
    pub fn native(&self, resolution: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(canonical, _)| canonical == resolution)
            .map(|(_, native)| native.as_str())
    }

    pub fn resolutions(&self) -> Vec<String> {
        self.entries.iter().map(|(canonical, _)| canonical.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Union of several tables' canonical resolutions, in canonical order.
pub fn union_resolutions<'a>(tables: impl IntoIterator<Item = &'a ResolutionTable>) -> Vec<String> {
    let tables: Vec<&ResolutionTable> = tables.into_iter().collect();
    TIMEFRAME_MAPPING
        .iter()
        .map(|(_, canonical)| *canonical)
        .filter(|canonical| tables.iter().any(|t| t.native(canonical).is_some()))
        .map(str::to_string)
        .collect()
}
