use chrono::Duration;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Tracked simulation statistics: display name as produced by the backtester
/// paired with the database-safe column alias.
pub const TRACKED_METRICS: [(&str, &str); 13] = [
    // Performance
    ("Total Return [%]", "total_return_pct"),
    ("Benchmark Return [%]", "benchmark_return_pct"),
    // Risk-adjusted
    ("Sharpe Ratio", "sharpe"),
    ("Calmar Ratio", "calmar"),
    ("Sortino Ratio", "sortino"),
    ("Omega Ratio", "omega"),
    // Drawdown
    ("Max Drawdown [%]", "max_dd_pct"),
    ("Max Drawdown Duration", "max_dd_duration"),
    // Trading quality
    ("Win Rate [%]", "win_rate_pct"),
    ("Profit Factor", "profit_factor"),
    ("Expectancy", "expectancy"),
    ("Total Trades", "total_trades"),
    ("Total Fees Paid", "total_fees_paid"),
];

/// The one duration-valued metric; stored as total seconds.
pub const DURATION_METRIC_ALIAS: &str = "max_dd_duration";

#[derive(Debug, Error)]
#[error("Unknown metric kind '{kind}' for key '{key}'")]
pub struct UnknownMetricKind {
    pub key: String,
    pub kind: String,
}

/// Discriminator describing why a stored numeric slot is null, as opposed to
/// holding a genuine finite value. Lets NaN/Inf survive generic numeric
/// storage and come back intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Value,
    PosInf,
    NegInf,
    Nan,
    Missing,
    Invalid,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Value => "value",
            MetricKind::PosInf => "pos_inf",
            MetricKind::NegInf => "neg_inf",
            MetricKind::Nan => "nan",
            MetricKind::Missing => "missing",
            MetricKind::Invalid => "invalid",
        }
    }

    pub fn parse(key: &str, raw: &str) -> Result<Self, UnknownMetricKind> {
        match raw {
            "value" => Ok(MetricKind::Value),
            "pos_inf" => Ok(MetricKind::PosInf),
            "neg_inf" => Ok(MetricKind::NegInf),
            "nan" => Ok(MetricKind::Nan),
            "missing" => Ok(MetricKind::Missing),
            "invalid" => Ok(MetricKind::Invalid),
            other => Err(UnknownMetricKind {
                key: key.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// Raw statistic value as produced by the backtester, before normalization.
#[derive(Debug, Clone)]
pub enum StatValue {
    Float(f64),
    Int(i64),
    Duration(Duration),
    Text(String),
}

pub type RawStats = HashMap<String, StatValue>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedMetric {
    pub value: Option<f64>,
    pub kind: MetricKind,
}

/// Storable representation of the tracked metrics: one (value, kind) pair per
/// alias, always fully populated. Invariant: `value` is non-null iff
/// `kind == Value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedMetrics {
    entries: BTreeMap<String, EncodedMetric>,
}

/// Reconstructed metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedValue {
    Float(f64),
    Duration(Duration),
}

impl DecodedValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            DecodedValue::Float(v) => *v,
            DecodedValue::Duration(d) => d.num_milliseconds() as f64 / 1000.0,
        }
    }
}

impl EncodedMetrics {
    pub fn get(&self, alias: &str) -> Option<&EncodedMetric> {
        self.entries.get(alias)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EncodedMetric)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat JSON shape used for storage: `alias` holds the nullable value and
    /// `alias_kind` the discriminator, for every tracked alias.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (alias, metric) in &self.entries {
            let value = metric
                .value
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            map.insert(alias.clone(), value);
            map.insert(
                format!("{}_kind", alias),
                Value::String(metric.kind.as_str().to_string()),
            );
        }
        Value::Object(map)
    }

    pub fn from_json(json: &Value) -> Result<Self, UnknownMetricKind> {
        let mut entries = BTreeMap::new();
        let Some(map) = json.as_object() else {
            return Ok(Self { entries });
        };

        for (key, raw) in map {
            if key.ends_with("_kind") {
                continue;
            }
            let kind = match map.get(&format!("{}_kind", key)) {
                Some(Value::String(tag)) => MetricKind::parse(key, tag)?,
                // Absent companion defaults to a plain value slot.
                _ => MetricKind::Value,
            };
            entries.insert(
                key.clone(),
                EncodedMetric {
                    value: raw.as_f64(),
                    kind,
                },
            );
        }

        Ok(Self { entries })
    }
}

/// Normalizes raw simulation statistics into their storable representation.
///
/// Every tracked metric always gets both its value slot and its kind slot:
/// absent metrics encode as `missing`, values that cannot be coerced to a
/// float as `invalid`, and non-finite floats as `nan`/`pos_inf`/`neg_inf`
/// with a null value. The duration-valued metric is stored as total seconds.
pub fn encode_metrics(stats: &RawStats) -> EncodedMetrics {
    let mut entries = BTreeMap::new();

    for (name, alias) in TRACKED_METRICS {
        let metric = match stats.get(name) {
            None => EncodedMetric {
                value: None,
                kind: MetricKind::Missing,
            },
            Some(raw) => match coerce_to_float(raw, alias) {
                Some(v) if v.is_nan() => EncodedMetric {
                    value: None,
                    kind: MetricKind::Nan,
                },
                Some(v) if v.is_infinite() => EncodedMetric {
                    value: None,
                    kind: if v > 0.0 {
                        MetricKind::PosInf
                    } else {
                        MetricKind::NegInf
                    },
                },
                Some(v) => EncodedMetric {
                    value: Some(v),
                    kind: MetricKind::Value,
                },
                None => EncodedMetric {
                    value: None,
                    kind: MetricKind::Invalid,
                },
            },
        };
        entries.insert(alias.to_string(), metric);
    }

    EncodedMetrics { entries }
}

fn coerce_to_float(raw: &StatValue, alias: &str) -> Option<f64> {
    match raw {
        StatValue::Float(v) => Some(*v),
        StatValue::Int(v) => Some(*v as f64),
        StatValue::Duration(d) if alias == DURATION_METRIC_ALIAS => {
            Some(d.num_milliseconds() as f64 / 1000.0)
        }
        StatValue::Duration(_) => None,
        StatValue::Text(s) => s.trim().parse::<f64>().ok(),
    }
}

/// Inverts [`encode_metrics`]: `value` becomes the stored float (seconds back
/// to a duration for the duration metric), the non-finite kinds become the
/// corresponding IEEE-754 specials, and `missing`/`invalid` become `None`,
/// or are omitted entirely when `drop_unrecoverable` is set. They are
/// intentionally lossy and never decode to a default number.
pub fn decode_metrics(
    encoded: &EncodedMetrics,
    drop_unrecoverable: bool,
) -> BTreeMap<String, Option<DecodedValue>> {
    let mut out = BTreeMap::new();

    for (alias, metric) in &encoded.entries {
        match metric.kind {
            MetricKind::Value => {
                if let Some(v) = metric.value {
                    let decoded = if alias == DURATION_METRIC_ALIAS {
                        DecodedValue::Duration(Duration::milliseconds((v * 1000.0).round() as i64))
                    } else {
                        DecodedValue::Float(v)
                    };
                    out.insert(alias.clone(), Some(decoded));
                }
            }
            MetricKind::PosInf => {
                out.insert(alias.clone(), Some(DecodedValue::Float(f64::INFINITY)));
            }
            MetricKind::NegInf => {
                out.insert(alias.clone(), Some(DecodedValue::Float(f64::NEG_INFINITY)));
            }
            MetricKind::Nan => {
                out.insert(alias.clone(), Some(DecodedValue::Float(f64::NAN)));
            }
            MetricKind::Missing | MetricKind::Invalid => {
                if !drop_unrecoverable {
                    out.insert(alias.clone(), None);
                }
            }
        }
    }

    out
}
