//! The read-evaluate-act loop
//!
//! ```text
//! WaitingForSample -> Evaluating -> (Actuating | Idle) -> WaitingForSample
//! ```
//!
//! A sample inside the hold-off window is reported without evaluation. After
//! an evaluation the window is `window_size` beats if anything was actuated,
//! otherwise a single beat.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cadence_common::{CadenceError, FeedbackSample, Result, SampleError};

use crate::actuator::{ActuatorKind, ActuatorSet, Machine};
use crate::controller::{DecisionStrategy, RateBand};
use crate::telemetry::LoopMetrics;

/// Source of heartbeat samples for the governed application
pub trait HeartbeatSource: Send {
    /// Latest sample; may repeat the previous beat if nothing new arrived
    fn next_sample(&mut self) -> std::result::Result<FeedbackSample, SampleError>;

    fn min_rate(&self) -> f64;

    fn max_rate(&self) -> f64;

    /// Beats in the application's rate window
    fn window_size(&self) -> i64;

    /// Release the source's resources
    fn finish(&mut self) {}
}

/// What the loop did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Inside the hold-off window, not evaluated
    HoldOff,
    /// Evaluated, nothing to apply
    Steady,
    /// At least one actuator was moved
    Actuated,
}

impl Action {
    pub fn as_char(self) -> char {
        match self {
            Action::HoldOff => '.',
            Action::Steady => '=',
            Action::Actuated => '*',
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One line of the status stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub at: DateTime<Utc>,
    pub beat: i64,
    pub windowed_rate: f64,
    pub skip_until_beat: i64,
    pub action: Action,
    /// Actuator values after this iteration, in actuator-set order
    pub values: Vec<u64>,
}

impl StatusRecord {
    pub fn to_tsv_line(&self) -> String {
        let mut line = format!(
            "{}\t{:.3}\t{}\t{}",
            self.beat, self.windowed_rate, self.skip_until_beat, self.action
        );
        for value in &self.values {
            line.push('\t');
            line.push_str(&value.to_string());
        }
        line
    }
}

/// Consumer of status records
pub trait StatusSink: Send {
    /// Called once before the first record
    fn header(&mut self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn record(&mut self, record: &StatusRecord) -> Result<()>;
}

/// Tab-separated status lines
pub struct TsvStatusSink<W> {
    out: W,
}

impl<W: Write + Send> TsvStatusSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> StatusSink for TsvStatusSink<W> {
    fn header(&mut self, names: &[String]) -> Result<()> {
        let mut line = String::from("beat\trate\tskip_until\tact");
        for name in names {
            line.push('\t');
            line.push_str(name);
        }
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(())
    }

    fn record(&mut self, record: &StatusRecord) -> Result<()> {
        writeln!(self.out, "{}", record.to_tsv_line())?;
        self.out.flush()?;
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonStatusSink<W> {
    out: W,
}

impl<W: Write + Send> JsonStatusSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> StatusSink for JsonStatusSink<W> {
    fn record(&mut self, record: &StatusRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

impl StatusSink for Vec<StatusRecord> {
    fn record(&mut self, record: &StatusRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Shared in-memory sink; clones see the same records
impl StatusSink for Arc<Mutex<Vec<StatusRecord>>> {
    fn record(&mut self, record: &StatusRecord) -> Result<()> {
        self.lock().push(record.clone());
        Ok(())
    }
}

/// Beat bookkeeping carried between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLoopState {
    /// Last beat handled, `-1` before the first sample
    pub last_beat: i64,
    /// First beat that may be evaluated again
    pub skip_until_beat: i64,
}

impl Default for ControlLoopState {
    fn default() -> Self {
        Self {
            last_beat: -1,
            skip_until_beat: 0,
        }
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub last_beat: i64,
    pub evaluated: u64,
    pub held_off: u64,
    pub actuations: u64,
    pub failures: u64,
}

pub struct ControlLoop {
    source: Box<dyn HeartbeatSource>,
    strategy: Box<dyn DecisionStrategy>,
    actuators: ActuatorSet,
    machine: Machine,
    sink: Box<dyn StatusSink>,
    state: ControlLoopState,
    summary: RunSummary,
    max_beats: Option<i64>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    metrics: Option<LoopMetrics>,
}

impl ControlLoop {
    pub fn new(
        source: Box<dyn HeartbeatSource>,
        strategy: Box<dyn DecisionStrategy>,
        actuators: ActuatorSet,
        machine: Machine,
        sink: Box<dyn StatusSink>,
    ) -> Self {
        Self {
            source,
            strategy,
            actuators,
            machine,
            sink,
            state: ControlLoopState::default(),
            summary: RunSummary {
                last_beat: -1,
                ..RunSummary::default()
            },
            max_beats: None,
            stop: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::ZERO,
            metrics: None,
        }
    }

    /// Exit after the sample whose beat reaches `max_beats`
    pub fn with_max_beats(mut self, max_beats: Option<i64>) -> Self {
        self.max_beats = max_beats;
        self
    }

    /// Flag checked once per iteration and while waiting for samples
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Pause between polls that produced no new sample
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_metrics(mut self, metrics: LoopMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ControlLoopState {
        self.state
    }

    pub fn actuators(&self) -> &ActuatorSet {
        &self.actuators
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    fn band(&self) -> RateBand {
        RateBand::new(self.source.min_rate(), self.source.max_rate())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Handle one fresh sample and return its status record
    pub fn step(&mut self, sample: FeedbackSample) -> StatusRecord {
        self.state.last_beat = sample.beat;
        self.summary.last_beat = sample.beat;
        if let Some(metrics) = &self.metrics {
            metrics.heart_rate.set(sample.windowed_rate);
        }

        if sample.beat < self.state.skip_until_beat {
            self.summary.held_off += 1;
            if let Some(metrics) = &self.metrics {
                metrics.samples_held_off.inc();
            }
            return self.status(&sample, Action::HoldOff);
        }

        self.summary.evaluated += 1;
        if let Some(metrics) = &self.metrics {
            metrics.samples_evaluated.inc();
        }

        let band = self.band();
        self.strategy.decide(&sample, &band, &mut self.actuators);

        let mut acted = false;
        for actuator in self.actuators.iter_mut().filter(|a| a.is_pending()) {
            let kind = actuator.kind();
            let from = actuator.current();
            let target = actuator.target();
            match actuator.apply(&mut self.machine) {
                Ok(()) => {
                    acted = true;
                    self.summary.actuations += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.actuations_total.inc();
                    }
                    debug!(beat = sample.beat, actuator = %kind, from, to = target, "actuated");
                }
                Err(e) => {
                    self.summary.failures += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.actuation_failures.inc();
                    }
                    warn!(beat = sample.beat, actuator = %kind, to = target, error = %e, "actuation failed");
                }
            }
        }

        let hold = if acted { self.source.window_size().max(1) } else { 1 };
        self.state.skip_until_beat = sample.beat + hold;

        if let (Some(metrics), Some(id)) = (
            &self.metrics,
            self.actuators.find(ActuatorKind::AggregateSpeed),
        ) {
            metrics
                .aggregate_speed
                .set(self.actuators.get(id).current() as f64);
        }

        self.status(
            &sample,
            if acted {
                Action::Actuated
            } else {
                Action::Steady
            },
        )
    }

    fn status(&self, sample: &FeedbackSample, action: Action) -> StatusRecord {
        StatusRecord {
            at: Utc::now(),
            beat: sample.beat,
            windowed_rate: sample.windowed_rate,
            skip_until_beat: self.state.skip_until_beat,
            action,
            values: self.actuators.values(),
        }
    }

    /// Poll the source until a sample newer than the last beat arrives.
    ///
    /// Returns `Ok(None)` when stopped; a closed source ends the wait with
    /// its error.
    pub fn wait_for_sample(&mut self) -> std::result::Result<Option<FeedbackSample>, SampleError> {
        loop {
            if self.stopped() {
                return Ok(None);
            }
            match self.source.next_sample() {
                Ok(sample) if sample.beat > self.state.last_beat => return Ok(Some(sample)),
                Ok(_) => {}
                Err(SampleError::Closed) => return Err(SampleError::Closed),
                Err(e) => debug!(error = %e, "no usable sample"),
            }
            if !self.poll_interval.is_zero() {
                std::thread::sleep(self.poll_interval);
            }
        }
    }

    /// Run until the beat ceiling, the stop flag, or the source closing
    pub fn run(mut self) -> Result<RunSummary> {
        info!(
            strategy = self.strategy.name(),
            min_rate = self.source.min_rate(),
            max_rate = self.source.max_rate(),
            window = self.source.window_size(),
            max_beats = ?self.max_beats,
            "control loop started"
        );

        let names = self.actuators.names();
        if let Err(e) = self.sink.header(&names) {
            warn!(error = %e, "failed to write status header");
        }

        let outcome = loop {
            let sample = match self.wait_for_sample() {
                Ok(Some(sample)) => sample,
                Ok(None) => {
                    info!(beat = self.state.last_beat, "stop requested");
                    break Ok(());
                }
                Err(SampleError::Closed) => {
                    info!(beat = self.state.last_beat, "heartbeat source closed");
                    break Ok(());
                }
                Err(e) => break Err(CadenceError::from(e)),
            };

            let record = self.step(sample);
            if let Err(e) = self.sink.record(&record) {
                warn!(beat = record.beat, error = %e, "failed to write status record");
            }

            if self.max_beats.is_some_and(|max| sample.beat >= max) {
                info!(beat = sample.beat, "beat ceiling reached");
                break Ok(());
            }
        };

        self.source.finish();
        outcome?;

        info!(
            evaluated = self.summary.evaluated,
            held_off = self.summary.held_off,
            actuations = self.summary.actuations,
            failures = self.summary.failures,
            "control loop finished"
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use cadence_common::ProcessId;

    use crate::actuator::SimulatedBackend;
    use crate::controller::StrategyKind;
    use crate::EngineConfig;

    struct Scripted {
        samples: VecDeque<std::result::Result<FeedbackSample, SampleError>>,
    }

    impl Scripted {
        fn new(samples: Vec<(i64, f64)>) -> Self {
            Self {
                samples: samples
                    .into_iter()
                    .map(|(beat, rate)| Ok(FeedbackSample::new(beat, rate)))
                    .collect(),
            }
        }
    }

    impl HeartbeatSource for Scripted {
        fn next_sample(&mut self) -> std::result::Result<FeedbackSample, SampleError> {
            self.samples.pop_front().unwrap_or(Err(SampleError::Closed))
        }

        fn min_rate(&self) -> f64 {
            10.0
        }

        fn max_rate(&self) -> f64 {
            20.0
        }

        fn window_size(&self) -> i64 {
            5
        }
    }

    fn core_loop(samples: Vec<(i64, f64)>) -> (ControlLoop, SimulatedBackend) {
        let host = SimulatedBackend::new(4, &[1000, 2000]);
        let mut machine = Machine::new(Box::new(host.clone()), ProcessId(42));
        let kinds = StrategyKind::CoreBangBang.actuator_kinds(machine.governed_cores());
        let actuators = ActuatorSet::init(&kinds, &mut machine).unwrap();
        let strategy = StrategyKind::CoreBangBang
            .build(&actuators, &EngineConfig::default())
            .unwrap();
        let control = ControlLoop::new(
            Box::new(Scripted::new(samples)),
            strategy,
            actuators,
            machine,
            Box::new(Vec::new()),
        );
        (control, host)
    }

    #[test]
    fn test_status_line_format() {
        let record = StatusRecord {
            at: Utc::now(),
            beat: 12,
            windowed_rate: 12.3456,
            skip_until_beat: 17,
            action: Action::Actuated,
            values: vec![2, 1600],
        };
        assert_eq!(record.to_tsv_line(), "12\t12.346\t17\t*\t2\t1600");
    }

    #[test]
    fn test_tsv_sink_writes_header_once() {
        let mut out = Vec::new();
        {
            let mut sink = TsvStatusSink::new(&mut out);
            sink.header(&["cores".to_string(), "freq".to_string()])
                .unwrap();
            sink.record(&StatusRecord {
                at: Utc::now(),
                beat: 1,
                windowed_rate: 0.5,
                skip_until_beat: 2,
                action: Action::Steady,
                values: vec![1, 1000],
            })
            .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "beat\trate\tskip_until\tact\tcores\tfreq\n1\t0.500\t2\t=\t1\t1000\n"
        );
    }

    #[test]
    fn test_json_sink_round_trips() {
        let mut out = Vec::new();
        let record = StatusRecord {
            at: Utc::now(),
            beat: 9,
            windowed_rate: 1.5,
            skip_until_beat: 10,
            action: Action::HoldOff,
            values: vec![3],
        };
        JsonStatusSink::new(&mut out).record(&record).unwrap();
        let parsed: StatusRecord = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_actuation_opens_full_window() {
        let (mut control, host) = core_loop(vec![]);
        let record = control.step(FeedbackSample::new(3, 1.0));
        assert_eq!(record.action, Action::Actuated);
        assert_eq!(record.skip_until_beat, 8);
        assert_eq!(record.values, vec![2]);
        assert_eq!(host.affinity(), 2);

        let held = control.step(FeedbackSample::new(4, 1.0));
        assert_eq!(held.action, Action::HoldOff);
        assert_eq!(held.skip_until_beat, 8);
    }

    #[test]
    fn test_steady_waits_one_beat() {
        let (mut control, _host) = core_loop(vec![]);
        let record = control.step(FeedbackSample::new(3, 15.0));
        assert_eq!(record.action, Action::Steady);
        assert_eq!(record.skip_until_beat, 4);
    }

    #[test]
    fn test_run_skips_stale_beats_and_honours_ceiling() {
        let (control, _host) = core_loop(vec![
            (1, 15.0),
            (1, 15.0),
            (2, 15.0),
            (3, 15.0),
            (4, 15.0),
        ]);
        let summary = control.with_max_beats(Some(3)).run().unwrap();
        assert_eq!(summary.last_beat, 3);
        assert_eq!(summary.evaluated, 3);
        assert_eq!(summary.actuations, 0);
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let (control, _host) = core_loop(vec![(1, 15.0), (2, 15.0)]);
        let stop = Arc::new(AtomicBool::new(true));
        let summary = control.with_stop_flag(stop).run().unwrap();
        assert_eq!(summary.evaluated, 0);
        assert_eq!(summary.last_beat, -1);
    }

    #[test]
    fn test_metrics_follow_the_loop() {
        let (control, _host) = core_loop(vec![]);
        let metrics = LoopMetrics::new().unwrap();
        let mut control = control.with_metrics(metrics.clone());
        control.step(FeedbackSample::new(1, 1.0));
        control.step(FeedbackSample::new(2, 1.0));
        assert_eq!(metrics.samples_evaluated.get(), 1);
        assert_eq!(metrics.samples_held_off.get(), 1);
        assert_eq!(metrics.actuations_total.get(), 1);
        assert_eq!(metrics.heart_rate.get(), 1.0);
    }
}
