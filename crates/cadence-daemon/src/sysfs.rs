//! Linux actuation: cpufreq through sysfs, affinity through `taskset`
//!
//! Frequencies are in kHz as cpufreq reports them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use cadence_common::{ActuationError, ProcessId};
use cadence_engine::actuator::{ActuationBackend, CoreMask};

const USERSPACE_GOVERNOR: &str = "userspace";

/// Reads and pins the CPU affinity of a process
pub trait AffinityControl: Send {
    fn get(&mut self, pid: ProcessId) -> Result<CoreMask, ActuationError>;

    /// Pin `pid` to cores `0..count`
    fn set(&mut self, pid: ProcessId, count: usize) -> Result<(), ActuationError>;
}

/// Affinity through the util-linux `taskset` binary
#[derive(Debug, Default)]
pub struct Taskset;

impl AffinityControl for Taskset {
    fn get(&mut self, pid: ProcessId) -> Result<CoreMask, ActuationError> {
        let output = Command::new("taskset")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map_err(|e| affinity_error(format!("cannot run taskset: {}", e)))?;
        if !output.status.success() {
            return Err(affinity_error(format!(
                "taskset -p {} exited with {}",
                pid, output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_taskset_mask(&stdout)
            .ok_or_else(|| affinity_error(format!("unexpected taskset output: {}", stdout.trim())))
    }

    fn set(&mut self, pid: ProcessId, count: usize) -> Result<(), ActuationError> {
        if count == 0 {
            return Err(ActuationError::OutOfRange {
                value: 0,
                min: 1,
                max: u64::MAX,
            });
        }
        let status = Command::new("taskset")
            .arg("-pc")
            .arg(format!("0-{}", count - 1))
            .arg(pid.to_string())
            .output()
            .map_err(|e| affinity_error(format!("cannot run taskset: {}", e)))?
            .status;
        if !status.success() {
            return Err(affinity_error(format!(
                "taskset -pc 0-{} {} exited with {}",
                count - 1,
                pid,
                status
            )));
        }
        Ok(())
    }
}

fn affinity_error(reason: String) -> ActuationError {
    ActuationError::Backend {
        actuator: "cores".into(),
        reason,
    }
}

/// Mask from `pid 42's current affinity mask: f`
pub fn parse_taskset_mask(output: &str) -> Option<CoreMask> {
    let token = output.split_whitespace().last()?;
    u64::from_str_radix(token.trim_start_matches("0x"), 16)
        .ok()
        .map(CoreMask)
}

/// Number of CPUs in a kernel cpu list such as `0-3,8,10-11`
pub fn parse_cpu_list(list: &str) -> Option<usize> {
    let mut count = 0usize;
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                count += hi - lo + 1;
            }
            None => {
                part.trim().parse::<usize>().ok()?;
                count += 1;
            }
        }
    }
    (count > 0).then_some(count)
}

/// CPUs listed in `/proc/stat` (`cpuN` lines, the aggregate `cpu` line excluded)
pub fn count_proc_stat_cpus(stat: &str) -> usize {
    stat.lines()
        .filter_map(|line| line.strip_prefix("cpu"))
        .filter(|rest| rest.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .count()
}

/// CPU count from `<root>/present`, then `/proc/stat`, then 1
pub fn detect_cpu_count(root: &Path) -> usize {
    if let Some(count) = fs::read_to_string(root.join("present"))
        .ok()
        .and_then(|list| parse_cpu_list(&list))
    {
        return count;
    }
    match fs::read_to_string("/proc/stat").map(|stat| count_proc_stat_cpus(&stat)) {
        Ok(count) if count > 0 => count,
        _ => {
            warn!(root = %root.display(), "cannot determine cpu count, assuming 1");
            1
        }
    }
}

/// cpufreq + affinity host
pub struct SysfsBackend {
    root: PathBuf,
    cpu_count: usize,
    affinity: Box<dyn AffinityControl>,
}

impl SysfsBackend {
    /// Open the cpufreq tree under `root` (normally `/sys/devices/system/cpu`)
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cpu_count = detect_cpu_count(&root);
        info!(root = %root.display(), cpu_count, "cpufreq backend opened");
        Self {
            root,
            cpu_count,
            affinity: Box::new(Taskset),
        }
    }

    pub fn with_affinity(mut self, affinity: Box<dyn AffinityControl>) -> Self {
        self.affinity = affinity;
        self
    }

    fn cpufreq(&self, core: usize, file: &str) -> PathBuf {
        self.root
            .join(format!("cpu{}", core))
            .join("cpufreq")
            .join(file)
    }

    fn read(&self, core: usize, file: &str) -> Result<String, ActuationError> {
        let path = self.cpufreq(core, file);
        fs::read_to_string(&path).map_err(|e| io_error(core, &path, e))
    }

    fn read_u64(&self, core: usize, file: &str) -> Result<u64, ActuationError> {
        let text = self.read(core, file)?;
        text.trim().parse().map_err(|_| ActuationError::Backend {
            actuator: format!("freq{}", core),
            reason: format!("{} holds '{}'", file, text.trim()),
        })
    }

    fn write(&self, core: usize, file: &str, value: &str) -> Result<(), ActuationError> {
        let path = self.cpufreq(core, file);
        fs::write(&path, value).map_err(|e| io_error(core, &path, e))
    }

    /// Switch the first `cores` cores to the userspace governor
    pub fn ensure_userspace_governor(&self, cores: usize) -> Result<(), ActuationError> {
        for core in 0..cores.min(self.cpu_count) {
            let governor = self.read(core, "scaling_governor")?;
            if governor.trim() == USERSPACE_GOVERNOR {
                continue;
            }
            self.write(core, "scaling_governor", USERSPACE_GOVERNOR)?;
            info!(core, from = governor.trim(), "switched to userspace governor");
        }
        Ok(())
    }
}

fn io_error(core: usize, path: &Path, e: io::Error) -> ActuationError {
    ActuationError::Backend {
        actuator: format!("freq{}", core),
        reason: format!("{}: {}", path.display(), e),
    }
}

impl ActuationBackend for SysfsBackend {
    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn get_affinity(&mut self, pid: ProcessId) -> Result<CoreMask, ActuationError> {
        self.affinity.get(pid)
    }

    fn set_affinity(&mut self, pid: ProcessId, count: usize) -> Result<(), ActuationError> {
        if count == 0 || count > self.cpu_count {
            return Err(ActuationError::OutOfRange {
                value: count as u64,
                min: 1,
                max: self.cpu_count as u64,
            });
        }
        self.affinity.set(pid, count)
    }

    fn get_frequency(&mut self, core: usize) -> Result<u64, ActuationError> {
        self.read_u64(core, "scaling_cur_freq")
    }

    fn set_frequency(&mut self, core: usize, freq: u64) -> Result<(), ActuationError> {
        debug!(core, freq, "scaling_setspeed");
        self.write(core, "scaling_setspeed", &freq.to_string())
    }

    fn available_frequencies(&mut self, core: usize) -> Result<Vec<u64>, ActuationError> {
        match self.read(core, "scaling_available_frequencies") {
            Ok(text) => {
                let mut freqs = text
                    .split_whitespace()
                    .map(|f| {
                        f.parse::<u64>().map_err(|_| ActuationError::Backend {
                            actuator: format!("freq{}", core),
                            reason: format!("bad frequency '{}'", f),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                freqs.sort_unstable();
                freqs.dedup();
                Ok(freqs)
            }
            // drivers without a frequency table only expose the limits
            Err(e) => {
                debug!(core, error = %e, "no frequency table, using hardware limits");
                let (min, max) = self.hardware_limits(core)?;
                Ok(if min == max { vec![min] } else { vec![min, max] })
            }
        }
    }

    fn hardware_limits(&mut self, core: usize) -> Result<(u64, u64), ActuationError> {
        Ok((
            self.read_u64(core, "cpuinfo_min_freq")?,
            self.read_u64(core, "cpuinfo_max_freq")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct FixedAffinity {
        count: usize,
    }

    impl AffinityControl for FixedAffinity {
        fn get(&mut self, _pid: ProcessId) -> Result<CoreMask, ActuationError> {
            Ok(CoreMask::first(self.count))
        }

        fn set(&mut self, _pid: ProcessId, count: usize) -> Result<(), ActuationError> {
            self.count = count;
            Ok(())
        }
    }

    fn fake_tree(cores: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present"), format!("0-{}\n", cores - 1)).unwrap();
        for core in 0..cores {
            let cpufreq = dir.path().join(format!("cpu{}", core)).join("cpufreq");
            fs::create_dir_all(&cpufreq).unwrap();
            fs::write(
                cpufreq.join("scaling_available_frequencies"),
                "2400000 1600000 800000 \n",
            )
            .unwrap();
            fs::write(cpufreq.join("cpuinfo_min_freq"), "800000\n").unwrap();
            fs::write(cpufreq.join("cpuinfo_max_freq"), "2400000\n").unwrap();
            fs::write(cpufreq.join("scaling_cur_freq"), "1600000\n").unwrap();
            fs::write(cpufreq.join("scaling_governor"), "ondemand\n").unwrap();
            fs::write(cpufreq.join("scaling_setspeed"), "<unsupported>\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_reads_cpufreq_tree() {
        let tree = fake_tree(2);
        let mut backend = SysfsBackend::open(tree.path());
        assert_eq!(backend.cpu_count(), 2);
        assert_eq!(
            backend.available_frequencies(1).unwrap(),
            vec![800000, 1600000, 2400000]
        );
        assert_eq!(backend.hardware_limits(0).unwrap(), (800000, 2400000));
        assert_eq!(backend.get_frequency(0).unwrap(), 1600000);
    }

    #[test]
    fn test_writes_setspeed_and_governor() {
        let tree = fake_tree(2);
        let mut backend = SysfsBackend::open(tree.path());
        backend.ensure_userspace_governor(2).unwrap();
        backend.set_frequency(1, 2400000).unwrap();

        let cpufreq = tree.path().join("cpu1").join("cpufreq");
        assert_eq!(
            fs::read_to_string(cpufreq.join("scaling_governor")).unwrap(),
            "userspace"
        );
        assert_eq!(
            fs::read_to_string(cpufreq.join("scaling_setspeed")).unwrap(),
            "2400000"
        );
    }

    #[test]
    fn test_missing_core_is_a_backend_error() {
        let tree = fake_tree(1);
        let mut backend = SysfsBackend::open(tree.path());
        assert!(matches!(
            backend.get_frequency(3),
            Err(ActuationError::Backend { .. })
        ));
    }

    #[test]
    fn test_frequency_table_falls_back_to_limits() {
        let tree = fake_tree(1);
        fs::remove_file(
            tree.path()
                .join("cpu0")
                .join("cpufreq")
                .join("scaling_available_frequencies"),
        )
        .unwrap();
        let mut backend = SysfsBackend::open(tree.path());
        assert_eq!(
            backend.available_frequencies(0).unwrap(),
            vec![800000, 2400000]
        );
    }

    #[test]
    fn test_affinity_bounds() {
        let tree = fake_tree(4);
        let mut backend = SysfsBackend::open(tree.path())
            .with_affinity(Box::new(FixedAffinity { count: 1 }));
        backend.set_affinity(ProcessId(9), 3).unwrap();
        assert_eq!(backend.get_affinity(ProcessId(9)).unwrap().count(), 3);
        assert!(backend.set_affinity(ProcessId(9), 5).is_err());
        assert!(backend.set_affinity(ProcessId(9), 0).is_err());
    }

    #[test]
    fn test_parse_taskset_mask() {
        assert_eq!(
            parse_taskset_mask("pid 4242's current affinity mask: f\n"),
            Some(CoreMask(0xf))
        );
        assert_eq!(parse_taskset_mask("ff"), Some(CoreMask(0xff)));
        assert_eq!(parse_taskset_mask(""), None);
        assert_eq!(parse_taskset_mask("mask: zz"), None);
    }

    #[test]
    fn test_cpu_counts() {
        assert_eq!(parse_cpu_list("0-7\n"), Some(8));
        assert_eq!(parse_cpu_list("0,2-3,8"), Some(4));
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("3-1"), None);

        let stat = "cpu  10 20 30\ncpu0 1 2 3\ncpu1 4 5 6\nintr 1\n";
        assert_eq!(count_proc_stat_cpus(stat), 2);
    }

    proptest! {
        #[test]
        fn prop_taskset_mask_roundtrip(count in 1usize..=64) {
            let line = format!("pid 1's current affinity mask: {}", CoreMask::first(count));
            prop_assert_eq!(parse_taskset_mask(&line).map(CoreMask::count), Some(count));
        }

        #[test]
        fn prop_cpu_range_count(lo in 0usize..64, len in 1usize..64) {
            let list = format!("{}-{}", lo, lo + len - 1);
            prop_assert_eq!(parse_cpu_list(&list), Some(len));
        }
    }
}
