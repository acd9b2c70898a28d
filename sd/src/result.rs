//! Probe samples and recorded results

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Divisor from the probe's bits per second to megabits per second
pub const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// Number of samples averaged by a full test
pub const FULL_TEST_SAMPLES: usize = 3;

/// Round to two decimal places, halves away from zero
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One raw measurement in the probe's native units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Latency (ping) in milliseconds
    pub latency: f64,
    /// Download throughput in bits per second
    pub download_bps: f64,
    /// Upload throughput in bits per second
    pub upload_bps: f64,
}

impl ProbeSample {
    pub fn new(latency: f64, download_bps: f64, upload_bps: f64) -> Self {
        Self {
            latency,
            download_bps,
            upload_bps,
        }
    }

    /// Arithmetic mean of each metric, without rounding
    pub fn mean(samples: &[ProbeSample]) -> Option<ProbeSample> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let sum = samples.iter().fold(ProbeSample::default(), |acc, s| ProbeSample {
            latency: acc.latency + s.latency,
            download_bps: acc.download_bps + s.download_bps,
            upload_bps: acc.upload_bps + s.upload_bps,
        });
        Some(ProbeSample {
            latency: sum.latency / n,
            download_bps: sum.download_bps / n,
            upload_bps: sum.upload_bps / n,
        })
    }
}

/// The outcome of one iteration, handed to the sink exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// Latency, native units, two decimals
    pub latency: f64,
    /// Download in Mbit/s, two decimals
    pub download_mbps: f64,
    /// Upload in Mbit/s, two decimals
    pub upload_mbps: f64,
}

impl ProbeResult {
    /// Convert and round a raw sample taken at `at`
    pub fn from_sample(sample: &ProbeSample, at: DateTime<Local>) -> Self {
        Self {
            date: at.date_naive(),
            time: whole_seconds(at.time()),
            latency: round2(sample.latency).max(0.0),
            download_mbps: round2(sample.download_bps / BITS_PER_MEGABIT).max(0.0),
            upload_mbps: round2(sample.upload_bps / BITS_PER_MEGABIT).max(0.0),
        }
    }

    /// The degraded result recorded when an iteration cannot produce data
    pub fn zeroed(at: DateTime<Local>) -> Self {
        Self::from_sample(&ProbeSample::default(), at)
    }

    pub fn is_zero(&self) -> bool {
        self.latency == 0.0 && self.download_mbps == 0.0 && self.upload_mbps == 0.0
    }

    /// `YYYY-MM-DD`
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// `HH:MM:SS`
    pub fn time_string(&self) -> String {
        self.time.format("%H:%M:%S").to_string()
    }
}

fn whole_seconds(time: NaiveTime) -> NaiveTime {
    use chrono::Timelike;
    time.with_nanosecond(0).unwrap_or(time)
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ping={:.2} down={:.2} up={:.2}",
            self.date_string(),
            self.time_string(),
            self.latency,
            self.download_mbps,
            self.upload_mbps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).single().unwrap()
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(5.5), 5.5);
        assert_eq!(round2(1.234), 1.23);
        assert_eq!(round2(1.236), 1.24);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_from_sample_converts_throughput() {
        let sample = ProbeSample::new(5.5, 55_000_000.0, 11_000_000.0);
        let result = ProbeResult::from_sample(&sample, at());

        assert_eq!(result.latency, 5.5);
        assert_eq!(result.download_mbps, 55.0);
        assert_eq!(result.upload_mbps, 11.0);
        assert!(!result.is_zero());
    }

    #[test]
    fn test_from_sample_rounds_after_conversion() {
        let sample = ProbeSample::new(12.3456, 93_456_789.0, 8_765_432.1);
        let result = ProbeResult::from_sample(&sample, at());

        assert_eq!(result.latency, 12.35);
        assert_eq!(result.download_mbps, 93.46);
        assert_eq!(result.upload_mbps, 8.77);
    }

    #[test]
    fn test_zeroed_keeps_timestamp() {
        let result = ProbeResult::zeroed(at());

        assert!(result.is_zero());
        assert_eq!(result.date_string(), "2024-03-09");
        assert_eq!(result.time_string(), "07:05:03");
    }

    #[test]
    fn test_mean_of_empty_is_none() {
        assert!(ProbeSample::mean(&[]).is_none());
    }

    #[test]
    fn test_mean_averages_raw_values() {
        let samples = [
            ProbeSample::new(0.005, 1_005.0, 0.0),
            ProbeSample::new(0.005, 1_005.0, 0.0),
            ProbeSample::new(0.0, 0.0, 0.0),
        ];
        let mean = ProbeSample::mean(&samples).unwrap();
        let result = ProbeResult::from_sample(&mean, at());

        // mean-then-round: 0.00333 -> 0.00
        assert_eq!(result.latency, 0.0);

        // round-then-mean would have recorded 0.01
        let rounded_first = round2(samples.iter().map(|s| round2(s.latency)).sum::<f64>() / 3.0);
        assert_eq!(rounded_first, 0.01);
        assert_ne!(result.latency, rounded_first);
    }

    #[test]
    fn test_display() {
        let result = ProbeResult::from_sample(&ProbeSample::new(5.5, 55_000_000.0, 11_000_000.0), at());
        assert_eq!(result.to_string(), "2024-03-09 07:05:03 ping=5.50 down=55.00 up=11.00");
    }

    proptest! {
        #[test]
        fn prop_recorded_metrics_have_two_decimals(
            latency in 0.0f64..10_000.0,
            down in 0.0f64..10_000_000_000.0,
            up in 0.0f64..10_000_000_000.0,
        ) {
            let result = ProbeResult::from_sample(&ProbeSample::new(latency, down, up), at());
            for value in [result.latency, result.download_mbps, result.upload_mbps] {
                prop_assert!(value >= 0.0);
                prop_assert!((value * 100.0 - (value * 100.0).round()).abs() < 1e-6);
            }
        }

        #[test]
        fn prop_mean_lies_between_extremes(values in proptest::collection::vec(0.0f64..1_000.0, FULL_TEST_SAMPLES)) {
            let samples: Vec<_> = values.iter().map(|v| ProbeSample::new(*v, *v, *v)).collect();
            let mean = ProbeSample::mean(&samples).unwrap();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(mean.latency >= min - 1e-9 && mean.latency <= max + 1e-9);
        }
    }
}
