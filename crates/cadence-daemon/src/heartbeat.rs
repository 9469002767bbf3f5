//! Heartbeat log reader
//!
//! The monitored application appends one `beat<TAB>windowed_rate` line per
//! heartbeat to `<heartbeat_dir>/<pid>.log`. The reader follows the file and
//! reports the newest complete record.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cadence_common::{FeedbackSample, ProcessId, SampleError};
use cadence_engine::control_loop::HeartbeatSource;

use crate::config::HeartbeatSettings;

/// Longest unterminated tail kept between reads
const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Log file of `pid` inside the heartbeat directory
pub fn log_path(dir: &Path, pid: ProcessId) -> PathBuf {
    dir.join(format!("{}.log", pid))
}

pub struct LogHeartbeatSource {
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    /// Bytes after the last newline seen
    pending: Vec<u8>,
    latest: Option<FeedbackSample>,
    min_rate: f64,
    max_rate: f64,
    window_size: i64,
}

impl LogHeartbeatSource {
    pub fn new(path: impl Into<PathBuf>, settings: &HeartbeatSettings) -> Self {
        Self {
            path: path.into(),
            file: None,
            offset: 0,
            pending: Vec::new(),
            latest: None,
            min_rate: settings.min_rate,
            max_rate: settings.max_rate,
            window_size: settings.window_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append whatever was written since the last read to `pending`
    fn read_new(&mut self) -> Result<(), SampleError> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| {
                SampleError::Unavailable(format!("{}: {}", self.path.display(), e))
            })?;
            debug!(path = %self.path.display(), "heartbeat log opened");
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let len = file
            .metadata()
            .map_err(|e| SampleError::Unavailable(e.to_string()))?
            .len();
        if len < self.offset {
            info!(path = %self.path.display(), "heartbeat log truncated, rereading");
            self.offset = 0;
            self.pending.clear();
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;
        let read = file
            .read_to_end(&mut self.pending)
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;
        self.offset += read as u64;
        Ok(())
    }

    /// Parse every complete line, keeping the newest good record.
    ///
    /// Returns the error of the last line when it did not parse.
    fn consume_lines(&mut self) -> Option<SampleError> {
        let mut malformed = None;
        if let Some(end) = self.pending.iter().rposition(|&b| b == b'\n') {
            let complete: Vec<u8> = self.pending.drain(..=end).collect();
            for raw in complete.split(|&b| b == b'\n') {
                let line = match std::str::from_utf8(raw) {
                    Ok(line) => line.trim(),
                    Err(e) => {
                        malformed = Some(SampleError::Malformed(format!("not UTF-8: {}", e)));
                        continue;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                match FeedbackSample::parse_record(line) {
                    Ok(sample) => {
                        self.latest = Some(sample);
                        malformed = None;
                    }
                    Err(e) => malformed = Some(e),
                }
            }
        }

        if self.pending.len() > MAX_PARTIAL_LINE {
            warn!(
                path = %self.path.display(),
                bytes = self.pending.len(),
                "discarding unterminated heartbeat line"
            );
            self.pending.clear();
            malformed = Some(SampleError::Malformed(format!(
                "line longer than {} bytes",
                MAX_PARTIAL_LINE
            )));
        }
        malformed
    }
}

impl HeartbeatSource for LogHeartbeatSource {
    fn next_sample(&mut self) -> Result<FeedbackSample, SampleError> {
        self.read_new()?;

        if let Some(e) = self.consume_lines() {
            return Err(e);
        }
        match self.latest {
            Some(sample) if sample.has_rate() => Ok(sample),
            Some(sample) => Err(SampleError::Unavailable(format!(
                "rate window not yet filled at beat {}",
                sample.beat
            ))),
            None => Err(SampleError::Unavailable(format!(
                "no heartbeat in {}",
                self.path.display()
            ))),
        }
    }

    fn min_rate(&self) -> f64 {
        self.min_rate
    }

    fn max_rate(&self) -> f64 {
        self.max_rate
    }

    fn window_size(&self) -> i64 {
        self.window_size
    }

    fn finish(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "heartbeat log closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        append_bytes(path, text.as_bytes());
    }

    fn append_bytes(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn test_missing_log_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            LogHeartbeatSource::new(log_path(dir.path(), ProcessId(5)), &HeartbeatSettings::default());
        assert!(matches!(
            source.next_sample(),
            Err(SampleError::Unavailable(_))
        ));
    }

    #[test]
    fn test_follows_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), ProcessId(5));
        let mut source = LogHeartbeatSource::new(&path, &HeartbeatSettings::default());

        append(&path, "1\t0.000\n2\t0.000\n");
        assert!(matches!(
            source.next_sample(),
            Err(SampleError::Unavailable(_))
        ));

        append(&path, "3\t12.500\n4\t13.");
        let sample = source.next_sample().unwrap();
        assert_eq!(sample, FeedbackSample::new(3, 12.5));

        append(&path, "000\n");
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(4, 13.0));
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(4, 13.0));
    }

    #[test]
    fn test_malformed_tail_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), ProcessId(5));
        let mut source = LogHeartbeatSource::new(&path, &HeartbeatSettings::default());

        append(&path, "1\t4.0\ngarbage\n");
        assert!(matches!(source.next_sample(), Err(SampleError::Malformed(_))));
        // the good record before it is still the latest
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(1, 4.0));
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), ProcessId(5));
        let mut source = LogHeartbeatSource::new(&path, &HeartbeatSettings::default());

        append_bytes(&path, b"1\t5.0\n\xff\n");
        assert!(matches!(source.next_sample(), Err(SampleError::Malformed(_))));
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(1, 5.0));

        append(&path, "2\t6.0\n3\t7.0\n");
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(3, 7.0));
    }

    #[test]
    fn test_runaway_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), ProcessId(5));
        let mut source = LogHeartbeatSource::new(&path, &HeartbeatSettings::default());

        append(&path, "1\t5.0\n");
        append(&path, &"x".repeat(MAX_PARTIAL_LINE + 1));
        assert!(matches!(source.next_sample(), Err(SampleError::Malformed(_))));
        assert!(source.pending.is_empty());

        append(&path, "\n2\t6.0\n");
        assert_eq!(source.next_sample().unwrap(), FeedbackSample::new(2, 6.0));
    }

    #[test]
    fn test_rate_band_from_settings() {
        let settings = HeartbeatSettings {
            min_rate: 3.0,
            max_rate: 7.0,
            window_size: 12,
            poll_interval_ms: 1,
        };
        let mut source = LogHeartbeatSource::new("/nonexistent/1.log", &settings);
        assert_eq!(source.min_rate(), 3.0);
        assert_eq!(source.max_rate(), 7.0);
        assert_eq!(source.window_size(), 12);
        source.finish();
    }
}
