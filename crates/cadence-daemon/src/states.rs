//! `cadence states`: print the machine-state table

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use cadence_engine::actuator::ActuationBackend;
use cadence_engine::catalog::{CatalogOptions, MachineStateCatalog};

use crate::config::DaemonConfig;
use crate::sysfs::SysfsBackend;

/// What to tabulate and which reductions to skip
#[derive(Debug, Clone, Default)]
pub struct StatesRequest {
    /// Core count; the host's when absent
    pub cores: Option<usize>,
    /// Available frequencies; core 0's cpufreq table when empty
    pub frequencies: Vec<u64>,
    /// Re-read a previously printed table instead of enumerating
    pub input: Option<PathBuf>,
    pub raw: bool,
    pub keep_permutations: bool,
    pub keep_equivalent: bool,
    pub keep_dominated: bool,
}

impl StatesRequest {
    pub fn options(&self, max_cores: usize) -> CatalogOptions {
        let mut options = if self.raw {
            CatalogOptions::raw()
        } else {
            CatalogOptions::default()
        };
        options.drop_permutations &= !self.keep_permutations;
        options.drop_equivalents &= !self.keep_equivalent;
        options.drop_dominated &= !self.keep_dominated;
        options.with_max_cores(max_cores)
    }
}

/// Build the requested catalog
pub fn build_catalog(request: &StatesRequest, config: &DaemonConfig) -> Result<MachineStateCatalog> {
    let engine = config.engine_config();
    let options = request.options(engine.max_catalog_cores);

    if let Some(path) = &request.input {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        return Ok(MachineStateCatalog::from_table(BufReader::new(file), &options)?);
    }

    let (cores, frequencies) = match (request.cores, request.frequencies.is_empty()) {
        (Some(cores), false) => (cores, request.frequencies.clone()),
        (cores, _) => {
            let mut host = SysfsBackend::open(&config.cpu.sysfs_root);
            let frequencies = if request.frequencies.is_empty() {
                host.available_frequencies(0)
                    .context("no --frequencies given and no cpufreq table readable")?
            } else {
                request.frequencies.clone()
            };
            let cores = cores.unwrap_or_else(|| host.cpu_count().min(engine.max_catalog_cores));
            (cores, frequencies)
        }
    };

    info!(cores, ?frequencies, "enumerating machine states");
    Ok(MachineStateCatalog::build_with(
        cores,
        &frequencies,
        &engine.power_model(),
        &options,
    )?)
}

/// Print the catalog as a tab-separated table
pub fn write_states<W: Write>(
    request: &StatesRequest,
    config: &DaemonConfig,
    out: W,
) -> Result<usize> {
    let catalog = build_catalog(request, config)?;
    catalog
        .write_table(out)
        .context("cannot write state table")?;
    Ok(catalog.len())
}
