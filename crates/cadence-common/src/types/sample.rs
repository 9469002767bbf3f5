//! Heartbeat feedback samples

use serde::{Deserialize, Serialize};

use crate::error::SampleError;

/// One heart-rate observation reported by the monitored application.
///
/// `beat` is monotonically non-decreasing across samples from one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSample {
    /// Heartbeat sequence number
    pub beat: i64,
    /// Heart rate over the application's sliding window (beats/s)
    pub windowed_rate: f64,
}

impl FeedbackSample {
    pub fn new(beat: i64, windowed_rate: f64) -> Self {
        Self {
            beat,
            windowed_rate,
        }
    }

    /// Parse a `beat<TAB>windowed_rate` record (any whitespace separates fields)
    pub fn parse_record(line: &str) -> Result<Self, SampleError> {
        let mut fields = line.split_whitespace();
        let beat = fields
            .next()
            .ok_or_else(|| SampleError::Malformed("empty record".into()))?
            .parse::<i64>()
            .map_err(|e| SampleError::Malformed(format!("beat: {}", e)))?;
        let windowed_rate = fields
            .next()
            .ok_or_else(|| SampleError::Malformed(format!("missing rate after beat {}", beat)))?
            .parse::<f64>()
            .map_err(|e| SampleError::Malformed(format!("rate: {}", e)))?;

        if !windowed_rate.is_finite() || windowed_rate < 0.0 {
            return Err(SampleError::Malformed(format!(
                "rate {} is not a non-negative number",
                windowed_rate
            )));
        }

        Ok(Self::new(beat, windowed_rate))
    }

    /// Whether the window has filled enough to report a rate
    pub fn has_rate(&self) -> bool {
        self.windowed_rate > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let sample = FeedbackSample::parse_record("42\t7.250").unwrap();
        assert_eq!(sample.beat, 42);
        assert!((sample.windowed_rate - 7.25).abs() < f64::EPSILON);
        assert!(sample.has_rate());
    }

    #[test]
    fn test_parse_record_rejects_garbage() {
        assert!(FeedbackSample::parse_record("").is_err());
        assert!(FeedbackSample::parse_record("12").is_err());
        assert!(FeedbackSample::parse_record("x 1.0").is_err());
        assert!(FeedbackSample::parse_record("3 NaN").is_err());
        assert!(FeedbackSample::parse_record("3 -1.0").is_err());
    }

    #[test]
    fn test_zero_rate_is_not_ready() {
        let sample = FeedbackSample::parse_record("1 0.0").unwrap();
        assert!(!sample.has_rate());
    }
}
