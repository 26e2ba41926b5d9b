use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FailsafeError, Result};

/// Side of the binary market (UP or DOWN)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "UP",
            Side::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "UP" | "YES" => Ok(Side::Up),
            "DOWN" | "NO" => Ok(Side::Down),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// A trading signal whose market window has resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledSignal {
    pub id: i64,
    pub window_id: String,
    pub predicted: Side,
    pub outcome: Side,
    pub settled_at: DateTime<Utc>,
}

impl SettledSignal {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.outcome
    }
}

/// Fraction of correct signals, `None` for an empty sample.
pub fn rolling_accuracy(signals: &[SettledSignal]) -> Option<f64> {
    if signals.is_empty() {
        return None;
    }
    let correct = signals.iter().filter(|s| s.is_correct()).count();
    Some(correct as f64 / signals.len() as f64)
}

/// Oracle price tick observed on the live feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl OracleTick {
    pub fn validate(&self) -> Result<()> {
        if self.price <= Decimal::ZERO {
            return Err(FailsafeError::InvalidPrice(format!(
                "{} tick has non-positive price {}",
                self.symbol, self.price
            )));
        }
        Ok(())
    }
}

/// Aggregate of oracle update timing over a time range
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateStats {
    pub count: i64,
    pub mean_interval_ms: Option<f64>,
    pub stddev_interval_ms: Option<f64>,
}

impl UpdateStats {
    /// Compute stats from raw update timestamps (any order).
    pub fn from_timestamps(timestamps: &[DateTime<Utc>]) -> Self {
        let mut sorted: Vec<i64> = timestamps.iter().map(|t| t.timestamp_millis()).collect();
        sorted.sort_unstable();
        let intervals: Vec<f64> = sorted.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        if intervals.is_empty() {
            return Self {
                count: sorted.len() as i64,
                mean_interval_ms: None,
                stddev_interval_ms: None,
            };
        }
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let stddev = if intervals.len() > 1 {
            let var = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
            Some(var.sqrt())
        } else {
            None
        };
        Self {
            count: sorted.len() as i64,
            mean_interval_ms: Some(mean),
            stddev_interval_ms: stddev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signal(id: i64, predicted: Side, outcome: Side) -> SettledSignal {
        SettledSignal {
            id,
            window_id: format!("btc-15m-{}", id),
            predicted,
            outcome,
            settled_at: Utc::now(),
        }
    }

    #[test]
    fn test_rolling_accuracy() {
        assert_eq!(rolling_accuracy(&[]), None);
        let signals = vec![
            signal(1, Side::Up, Side::Up),
            signal(2, Side::Up, Side::Down),
            signal(3, Side::Down, Side::Down),
            signal(4, Side::Down, Side::Up),
        ];
        assert_eq!(rolling_accuracy(&signals), Some(0.5));
    }

    #[test]
    fn test_update_stats_from_timestamps() {
        let t0 = Utc::now();
        let ts: Vec<_> = [0, 1000, 3000, 6000]
            .iter()
            .map(|ms| t0 + Duration::milliseconds(*ms))
            .collect();
        let stats = UpdateStats::from_timestamps(&ts);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean_interval_ms, Some(2000.0));
        assert!(stats.stddev_interval_ms.unwrap() > 0.0);
    }

    #[test]
    fn test_tick_price_validation() {
        let tick = OracleTick {
            symbol: "btc/usd".into(),
            price: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert!(matches!(tick.validate(), Err(FailsafeError::InvalidPrice(_))));
    }
}
