//! Price series loading
//!
//! The optimizer only sees a validated `Arc<[Kline]>`. Where the bars come
//! from is behind `KlineSource`; load failures and empty results are fatal
//! and reported once, before the first generation.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{DataError, OptimizerError};
use crate::types::Kline;

/// What to load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub symbol: String,
    pub interval: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl LoadRequest {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            start: None,
            end: None,
        }
    }

    /// Keep bars whose open time falls inside `[start, end]`
    pub fn contains(&self, kline: &Kline) -> bool {
        let after_start = self
            .start
            .map_or(true, |s| kline.open_time >= s.timestamp_millis());
        let before_end = self
            .end
            .map_or(true, |e| kline.open_time <= e.timestamp_millis());
        after_start && before_end
    }
}

#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> Result<Vec<Kline>>;
}

/// Check the series is usable: non-empty, strictly chronological, positive closes.
pub fn validate_klines(klines: &[Kline]) -> Result<(), DataError> {
    if klines.is_empty() {
        return Err(DataError::Empty);
    }
    for (index, kline) in klines.iter().enumerate() {
        if kline.close <= Decimal::ZERO {
            return Err(DataError::NonPositivePrice { index });
        }
        if index > 0 && kline.open_time <= klines[index - 1].open_time {
            return Err(DataError::NotChronological { index });
        }
    }
    Ok(())
}

/// Load through `source` and validate, once, before optimization starts.
pub async fn load_validated(
    source: &dyn KlineSource,
    request: &LoadRequest,
) -> Result<Arc<[Kline]>, OptimizerError> {
    let klines = source
        .load(request)
        .await
        .map_err(|e| DataError::Load(format!("{e:#}")))?;
    validate_klines(&klines)?;

    info!(
        symbol = %request.symbol,
        interval = %request.interval,
        bars = klines.len(),
        "Price series loaded"
    );
    Ok(Arc::from(klines))
}

// ============================================================================
// Sources
// ============================================================================

/// Bars already in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    klines: Vec<Kline>,
}

impl MemorySource {
    pub fn new(klines: Vec<Kline>) -> Self {
        Self { klines }
    }
}

#[async_trait]
impl KlineSource for MemorySource {
    async fn load(&self, request: &LoadRequest) -> Result<Vec<Kline>> {
        Ok(self
            .klines
            .iter()
            .filter(|k| request.contains(k))
            .cloned()
            .collect())
    }
}

/// Leading columns of a Binance kline row; the trailing ones are dropped
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KlineFile {
    Objects(Vec<Kline>),
    Rows(Vec<Vec<serde_json::Value>>),
}

/// JSON file holding either `Kline` objects or Binance-style kline rows
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(text: &str) -> Result<Vec<Kline>> {
        let file: KlineFile = serde_json::from_str(text).context("Unrecognised kline JSON")?;
        let klines = match file {
            KlineFile::Objects(klines) => klines,
            KlineFile::Rows(rows) => rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| parse_row(row).with_context(|| format!("Bad kline row {i}")))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(klines)
    }
}

fn parse_row(mut row: Vec<serde_json::Value>) -> Result<Kline> {
    row.truncate(7);
    let raw: RawKline = serde_json::from_value(serde_json::Value::Array(row))?;
    Ok(Kline {
        open_time: raw.0,
        open: Decimal::from_str(&raw.1)?,
        high: Decimal::from_str(&raw.2)?,
        low: Decimal::from_str(&raw.3)?,
        close: Decimal::from_str(&raw.4)?,
        volume: Decimal::from_str(&raw.5)?,
        close_time: raw.6,
    })
}

#[async_trait]
impl KlineSource for JsonFileSource {
    async fn load(&self, request: &LoadRequest) -> Result<Vec<Kline>> {
        debug!(path = %self.path.display(), "Reading klines");
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        let klines: Vec<Kline> = Self::parse(&text)?
            .into_iter()
            .filter(|k| request.contains(k))
            .collect();
        debug!(count = klines.len(), "Read klines");
        Ok(klines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn kline(i: i64, close: Decimal) -> Kline {
        Kline {
            open_time: i * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_time: (i + 1) * 60_000 - 1,
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl KlineSource for BrokenSource {
        async fn load(&self, _request: &LoadRequest) -> Result<Vec<Kline>> {
            anyhow::bail!("exchange unreachable")
        }
    }

    #[test]
    fn test_validate_klines() {
        assert_eq!(validate_klines(&[]), Err(DataError::Empty));
        assert!(validate_klines(&[kline(0, dec!(1)), kline(1, dec!(2))]).is_ok());
        assert_eq!(
            validate_klines(&[kline(1, dec!(1)), kline(1, dec!(2))]),
            Err(DataError::NotChronological { index: 1 })
        );
        assert_eq!(
            validate_klines(&[kline(0, dec!(1)), kline(1, Decimal::ZERO)]),
            Err(DataError::NonPositivePrice { index: 1 })
        );
    }

    #[tokio::test]
    async fn test_memory_source_honours_range() {
        let source = MemorySource::new((0..10).map(|i| kline(i, dec!(100))).collect());
        let mut request = LoadRequest::new("BTCUSDT", "1m");
        request.start = Utc.timestamp_millis_opt(3 * 60_000).single();
        request.end = Utc.timestamp_millis_opt(5 * 60_000).single();
        let klines = load_validated(&source, &request).await.unwrap();
        assert_eq!(klines.len(), 3);
        assert_eq!(klines[0].open_time, 3 * 60_000);
    }

    #[tokio::test]
    async fn test_load_failures_are_fatal() {
        let request = LoadRequest::new("BTCUSDT", "1h");
        let err = load_validated(&BrokenSource, &request).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Data(DataError::Load(ref m)) if m.contains("unreachable")));

        let err = load_validated(&MemorySource::default(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::Data(DataError::Empty)));
    }

    #[test]
    fn test_parse_binance_rows() {
        let text = r#"[
            [1700000000000, "100.5", "101", "99.5", "100.8", "12.3", 1700000059999, "1240.1", 42, "6", "600", "0"],
            [1700000060000, "100.8", "102", "100", "101.9", "8", 1700000119999, "815.2", 17, "3", "300", "0"]
        ]"#;
        let klines = JsonFileSource::parse(text).unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[1].close, dec!(101.9));
        assert_eq!(klines[0].close_time, 1_700_000_059_999);
    }

    #[test]
    fn test_parse_kline_objects() {
        let original = vec![kline(0, dec!(10)), kline(1, dec!(11))];
        let text = serde_json::to_string(&original).unwrap();
        assert_eq!(JsonFileSource::parse(&text).unwrap(), original);
        assert!(JsonFileSource::parse("{\"nope\": 1}").is_err());
    }

    #[tokio::test]
    async fn test_json_file_source_reads_disk() {
        let path = std::env::temp_dir().join(format!("dca-tuner-klines-{}.json", std::process::id()));
        let klines: Vec<Kline> = (0..5).map(|i| kline(i, dec!(50))).collect();
        std::fs::write(&path, serde_json::to_string(&klines).unwrap()).unwrap();

        let source = JsonFileSource::new(&path);
        let loaded = load_validated(&source, &LoadRequest::new("ETHUSDT", "1m"))
            .await
            .unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), 5);

        let missing = JsonFileSource::new(path.with_extension("missing"));
        assert!(load_validated(&missing, &LoadRequest::new("ETHUSDT", "1m"))
            .await
            .is_err());
    }
}
