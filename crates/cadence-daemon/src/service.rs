//! Wiring: host backend, catalog, actuators, strategy and the control loop

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, instrument, warn};

use cadence_common::ProcessId;
use cadence_engine::actuator::{ActuationBackend, ActuatorSet, Machine, SimulatedBackend};
use cadence_engine::catalog::{MachineStateCatalog, StateSelector};
use cadence_engine::control_loop::{
    ControlLoop, HeartbeatSource, JsonStatusSink, RunSummary, StatusSink, TsvStatusSink,
};
use cadence_engine::LoopMetrics;

use crate::config::{DaemonConfig, StatusFormat};
use crate::discovery::wait_for_target;
use crate::heartbeat::{log_path, LogHeartbeatSource};
use crate::sysfs::SysfsBackend;

/// Ladder (kHz) used by a dry run when the host exposes no cpufreq table
pub const SIMULATED_FREQUENCIES: [u64; 3] = [800_000, 1_600_000, 2_400_000];

/// Status sink on stdout in the configured format
pub fn stdout_sink(format: StatusFormat) -> Box<dyn StatusSink> {
    match format {
        StatusFormat::Tsv => Box::new(TsvStatusSink::new(std::io::stdout())),
        StatusFormat::Json => Box::new(JsonStatusSink::new(std::io::stdout())),
    }
}

/// In-memory host shaped like the real one, for `--dry-run`
pub fn simulated_host(config: &DaemonConfig) -> SimulatedBackend {
    let mut probe = SysfsBackend::open(&config.cpu.sysfs_root);
    let cpu_count = probe.cpu_count();
    let frequencies = probe
        .available_frequencies(0)
        .ok()
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| SIMULATED_FREQUENCIES.to_vec());
    info!(cpu_count, ?frequencies, "simulating host");
    SimulatedBackend::new(cpu_count, &frequencies)
}

/// The real host, switched to the userspace governor when configured
pub fn sysfs_host(config: &DaemonConfig) -> Result<SysfsBackend> {
    let backend = SysfsBackend::open(&config.cpu.sysfs_root);
    if config.cpu.set_userspace_governor {
        let cores = backend.cpu_count();
        backend
            .ensure_userspace_governor(cores)
            .context("cannot switch to the userspace governor")?;
    }
    Ok(backend)
}

/// Initialize actuators and the strategy for `pid` on `backend`
#[instrument(skip_all, fields(strategy = %config.strategy, %pid))]
pub fn build_control_loop(
    config: &DaemonConfig,
    pid: ProcessId,
    backend: Box<dyn ActuationBackend>,
    source: Box<dyn HeartbeatSource>,
    sink: Box<dyn StatusSink>,
) -> Result<ControlLoop> {
    let engine = config.engine_config();
    let mut machine = Machine::new(backend, pid);

    if config.strategy.needs_catalog() {
        let cores = machine.cpu_count().min(engine.max_catalog_cores);
        if cores < machine.cpu_count() {
            warn!(
                cpu_count = machine.cpu_count(),
                cores, "catalog limited to the first cores"
            );
        }
        let ladder = machine.frequency_ladder(0)?;
        let catalog = MachineStateCatalog::build_with(
            cores,
            &ladder,
            &engine.power_model(),
            &engine.catalog_options(),
        )?;
        info!(
            cores,
            frequencies = ladder.len(),
            states = catalog.len(),
            min_speed = catalog.min_speed(),
            max_speed = catalog.max_speed(),
            "machine-state catalog built"
        );
        machine = machine.with_selector(StateSelector::new(Arc::new(catalog)));
    }

    let kinds = config.strategy.actuator_kinds(machine.governed_cores());
    let actuators = ActuatorSet::init(&kinds, &mut machine)?;
    let strategy = config.strategy.build(&actuators, &engine)?;

    Ok(ControlLoop::new(source, strategy, actuators, machine, sink)
        .with_max_beats(config.max_beats)
        .with_poll_interval(Duration::from_millis(config.heartbeat.poll_interval_ms)))
}

/// Discover the target, then govern it until the beat ceiling or `stop`.
///
/// Returns `None` when stopped before a target appeared.
pub async fn run(
    config: DaemonConfig,
    stop: Arc<AtomicBool>,
    metrics: Option<LoopMetrics>,
    sink: Box<dyn StatusSink>,
) -> Result<Option<RunSummary>> {
    let dir = config.heartbeat_dir.clone().ok_or_else(|| {
        anyhow!(
            "no heartbeat directory: set heartbeat_dir or {}",
            cadence_common::HEARTBEAT_DIR_ENV
        )
    })?;
    let interval = Duration::from_millis(config.heartbeat.poll_interval_ms.max(1));

    let Some(pid) = wait_for_target(&dir, interval, &stop).await? else {
        return Ok(None);
    };

    let backend: Box<dyn ActuationBackend> = if config.dry_run {
        Box::new(simulated_host(&config))
    } else {
        Box::new(sysfs_host(&config)?)
    };
    let source = Box::new(LogHeartbeatSource::new(
        log_path(&dir, pid),
        &config.heartbeat,
    ));

    let mut control =
        build_control_loop(&config, pid, backend, source, sink)?.with_stop_flag(stop);
    if let Some(metrics) = metrics {
        control = control.with_metrics(metrics);
    }

    let summary = tokio::task::spawn_blocking(move || control.run())
        .await
        .context("control loop panicked")??;
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex;

    use cadence_engine::control_loop::{Action, StatusRecord};
    use cadence_engine::StrategyKind;

    fn heartbeat_dir(pid: u32, log: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(pid.to_string()), b"").unwrap();
        fs::write(dir.path().join(format!("{}.log", pid)), log).unwrap();
        dir
    }

    fn dry_config(dir: &tempfile::TempDir, strategy: StrategyKind) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.strategy = strategy;
        config.heartbeat_dir = Some(dir.path().to_path_buf());
        config.dry_run = true;
        config.cpu.sysfs_root = dir.path().join("no-sysfs");
        config.heartbeat.poll_interval_ms = 1;
        config.heartbeat.window_size = 2;
        config
    }

    #[tokio::test]
    async fn test_dry_run_until_beat_ceiling() {
        let dir = heartbeat_dir(31, "1\t2.0\n");
        let log = dir.path().join("31.log");
        let mut config = dry_config(&dir, StrategyKind::CoreBangBang);
        config.max_beats = Some(3);

        let records = Arc::new(Mutex::new(Vec::<StatusRecord>::new()));
        let writer = tokio::spawn(async move {
            for beat in 2..=3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut file = fs::OpenOptions::new().append(true).open(&log).unwrap();
                writeln!(file, "{}\t2.0", beat).unwrap();
            }
        });

        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            run(
                config,
                Arc::new(AtomicBool::new(false)),
                None,
                Box::new(records.clone()),
            ),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        writer.await.unwrap();

        assert_eq!(summary.last_beat, 3);
        let records = records.lock();
        assert_eq!(records.len(), 3);
        assert_ne!(records[0].action, Action::HoldOff);
    }

    #[tokio::test]
    async fn test_stop_flag_ends_dry_run() {
        let dir = heartbeat_dir(32, "1\t15.0\n");
        let config = dry_config(&dir, StrategyKind::Uncoordinated);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run(config, stop.clone(), None, Box::new(Vec::new())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);

        let summary = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.last_beat, 1);
        assert_eq!(summary.evaluated, 1);
    }

    #[tokio::test]
    async fn test_stop_before_target_appears() {
        let dir = tempfile::tempdir().unwrap();
        let config = dry_config(&dir, StrategyKind::Dummy);
        let stop = Arc::new(AtomicBool::new(true));

        let outcome = run(config, stop, None, Box::new(Vec::new())).await.unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_speed_strategy_builds_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = dry_config(&dir, StrategyKind::SpeedProportional);
        config.cpu.max_cores = 2;

        let host = SimulatedBackend::new(4, &[1000, 2000]);
        let source = LogHeartbeatSource::new(dir.path().join("1.log"), &config.heartbeat);
        let control = build_control_loop(
            &config,
            ProcessId(1),
            Box::new(host),
            Box::new(source),
            Box::new(Vec::new()),
        )
        .unwrap();

        let catalog = control.machine().catalog().unwrap();
        assert_eq!(catalog.core_count(), 2);
        assert_eq!(catalog.max_speed(), 4000);
        assert_eq!(control.actuators().names(), vec!["speed"]);
        assert_eq!(control.strategy_name(), "speed-proportional");
    }

    #[tokio::test]
    async fn test_missing_heartbeat_dir_is_fatal() {
        let outcome = run(
            DaemonConfig::default(),
            Arc::new(AtomicBool::new(false)),
            None,
            Box::new(Vec::new()),
        )
        .await;
        assert!(outcome.is_err());
    }
}
