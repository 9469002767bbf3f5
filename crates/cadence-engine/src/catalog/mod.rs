//! Machine-state catalog
//!
//! Enumerates every `(core, frequency)` assignment, then reduces the space to
//! a speed-sorted, Pareto-optimal table:
//!
//! ```text
//! enumerate (F+1)^C ─▶ canonicalize ─▶ sort ─▶ drop equivalents ─▶ Pareto filter
//! ```
//!
//! Rows are ordered by ascending speed, ties by descending power, then by
//! descending frequency vector so the most core-concentrated assignment of an
//! equivalent group comes first.

pub mod selector;
pub mod state;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use tracing::{debug, info};

use cadence_common::{CatalogError, DEFAULT_MAX_CATALOG_CORES};

pub use self::selector::{Selection, StateSelector};
pub use self::state::{LinearPowerModel, MachineState, PowerModel};

/// Which reduction stages run when a catalog is built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogOptions {
    /// Keep one representative per multiset of frequencies
    pub drop_permutations: bool,
    /// Keep only the first state among equal `(speed, power)`
    pub drop_equivalents: bool,
    /// Keep only the Pareto frontier
    pub drop_dominated: bool,
    /// Refuse to enumerate more cores than this
    pub max_cores: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            drop_permutations: true,
            drop_equivalents: true,
            drop_dominated: true,
            max_cores: DEFAULT_MAX_CATALOG_CORES,
        }
    }
}

impl CatalogOptions {
    /// No reduction at all, only sorting
    pub fn raw() -> Self {
        Self {
            drop_permutations: false,
            drop_equivalents: false,
            drop_dominated: false,
            ..Self::default()
        }
    }

    pub fn with_max_cores(mut self, max_cores: usize) -> Self {
        self.max_cores = max_cores;
        self
    }
}

/// Sorted, immutable table of machine states
#[derive(Debug, Clone)]
pub struct MachineStateCatalog {
    core_count: usize,
    /// Distinct available frequencies, ascending
    frequencies: Vec<u64>,
    states: Vec<MachineState>,
}

impl MachineStateCatalog {
    /// Build the reduced catalog with the default power model
    pub fn build(core_count: usize, frequencies: &[u64]) -> Result<Self, CatalogError> {
        Self::build_with(
            core_count,
            frequencies,
            &LinearPowerModel::default(),
            &CatalogOptions::default(),
        )
    }

    /// Build a catalog with an explicit power model and reduction stages
    pub fn build_with(
        core_count: usize,
        frequencies: &[u64],
        model: &dyn PowerModel,
        options: &CatalogOptions,
    ) -> Result<Self, CatalogError> {
        if core_count > options.max_cores {
            return Err(CatalogError::TooManyCores {
                core_count,
                max: options.max_cores,
            });
        }

        let ascending: Vec<u64> = frequencies
            .iter()
            .copied()
            .filter(|&f| f > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ascending.is_empty() {
            return Err(CatalogError::NoFrequencies);
        }
        let freq_count = ascending.len();

        // Digit i selects choices[i]; the last choice is "off"
        let choices: Vec<u64> = ascending
            .iter()
            .rev()
            .copied()
            .chain(std::iter::once(0))
            .collect();

        let capacity = table_size(core_count, choices.len(), options.drop_permutations)
            .ok_or(CatalogError::Allocation {
                core_count,
                freq_count,
            })?;

        let mut states = Vec::new();
        states
            .try_reserve_exact(capacity)
            .map_err(|_| CatalogError::Allocation {
                core_count,
                freq_count,
            })?;

        let odometer = Odometer::new(core_count, choices.len(), options.drop_permutations);
        for digits in odometer {
            let assignment: Vec<u64> = digits.iter().map(|&d| choices[d]).collect();
            states.push(MachineState::from_frequencies(assignment, model));
        }
        debug!(
            core_count,
            freq_count,
            generated = states.len(),
            "enumerated machine states"
        );

        let states = refine(states, options);
        if states.is_empty() {
            return Err(CatalogError::Empty {
                core_count,
                freq_count,
            });
        }

        info!(
            core_count,
            freq_count,
            states = states.len(),
            min_speed = states[0].speed,
            max_speed = states[states.len() - 1].speed,
            "machine-state catalog ready"
        );

        Ok(Self {
            core_count,
            frequencies: ascending,
            states,
        })
    }

    /// Load a tab-separated table (as written by [`write_table`]) and reduce it.
    ///
    /// The header `speed power core0 core1 ...` fixes the core count; the
    /// stored speed and power columns are taken as given.
    ///
    /// [`write_table`]: MachineStateCatalog::write_table
    pub fn from_table<R: BufRead>(reader: R, options: &CatalogOptions) -> Result<Self, CatalogError> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| CatalogError::InvalidTable("missing header".into()))?
            .map_err(|e| CatalogError::InvalidTable(e.to_string()))?;

        let core_count = header
            .split_whitespace()
            .filter_map(|token| token.strip_prefix("core"))
            .filter_map(|n| n.parse::<usize>().ok())
            .map(|n| n + 1)
            .max()
            .ok_or_else(|| CatalogError::InvalidTable("header names no cores".into()))?;

        let mut states = Vec::new();
        for (row, line) in lines.enumerate() {
            let line = line.map_err(|e| CatalogError::InvalidTable(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let values = line
                .split_whitespace()
                .map(str::parse::<u64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CatalogError::InvalidTable(format!("row {}: {}", row + 1, e)))?;
            if values.len() != core_count + 2 {
                return Err(CatalogError::InvalidTable(format!(
                    "row {}: expected {} columns, got {}",
                    row + 1,
                    core_count + 2,
                    values.len()
                )));
            }
            states.push(MachineState {
                speed: values[0],
                power: values[1],
                frequencies: values[2..].to_vec(),
            });
        }

        let frequencies: Vec<u64> = states
            .iter()
            .flat_map(|s| s.frequencies.iter().copied())
            .filter(|&f| f > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let freq_count = frequencies.len();

        let states = refine(states, options);
        if states.is_empty() {
            return Err(CatalogError::Empty {
                core_count,
                freq_count,
            });
        }

        Ok(Self {
            core_count,
            frequencies,
            states,
        })
    }

    /// Write the catalog as `speed\tpower\tcore0\t...` rows
    pub fn write_table<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        write!(out, "speed\tpower")?;
        for core in 0..self.core_count {
            write!(out, "\tcore{}", core)?;
        }
        writeln!(out)?;

        for state in &self.states {
            write!(out, "{}\t{}", state.speed, state.power)?;
            for freq in &state.frequencies {
                write!(out, "\t{}", freq)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn frequencies(&self) -> &[u64] {
        &self.frequencies
    }

    pub fn states(&self) -> &[MachineState] {
        &self.states
    }

    pub fn get(&self, index: usize) -> Option<&MachineState> {
        self.states.get(index)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Speed of the slowest usable state
    pub fn min_speed(&self) -> u64 {
        self.states.first().map(|s| s.speed).unwrap_or(0)
    }

    /// Speed of the fastest state
    pub fn max_speed(&self) -> u64 {
        self.states.last().map(|s| s.speed).unwrap_or(0)
    }

    /// The ascending speed column
    pub fn speeds(&self) -> Vec<u64> {
        self.states.iter().map(|s| s.speed).collect()
    }
}

/// Sort and run the enabled reduction stages
fn refine(mut states: Vec<MachineState>, options: &CatalogOptions) -> Vec<MachineState> {
    states.retain(|s| s.speed > 0);
    if options.drop_permutations {
        states.retain(MachineState::is_canonical);
    }

    states.sort_by(compare_states);

    if options.drop_equivalents {
        // dedup_by removes the later element of each equal pair
        states.dedup_by(|later, earlier| {
            later.speed == earlier.speed && later.power == earlier.power
        });
    }

    if options.drop_dominated {
        states = pareto_frontier(states);
    }

    states
}

fn compare_states(a: &MachineState, b: &MachineState) -> Ordering {
    a.speed
        .cmp(&b.speed)
        .then_with(|| b.power.cmp(&a.power))
        .then_with(|| b.frequencies.cmp(&a.frequencies))
}

/// Keep states that no equal-or-faster state beats on power.
///
/// Expects `states` sorted by [`compare_states`]. The forward scan is folded
/// into a suffix minimum; the backward scan stops at the first slower state.
fn pareto_frontier(states: Vec<MachineState>) -> Vec<MachineState> {
    let n = states.len();
    let mut suffix_min = vec![u64::MAX; n + 1];
    for i in (0..n).rev() {
        suffix_min[i] = suffix_min[i + 1].min(states[i].power);
    }

    let keep: Vec<bool> = (0..n)
        .map(|i| {
            let state = &states[i];
            if suffix_min[i + 1] < state.power {
                return false;
            }
            !states[..i]
                .iter()
                .rev()
                .take_while(|other| other.speed >= state.speed)
                .any(|other| other.power < state.power)
        })
        .collect();

    states
        .into_iter()
        .zip(keep)
        .filter_map(|(state, keep)| keep.then_some(state))
        .collect()
}

/// Number of rows the enumeration produces, `None` on overflow
fn table_size(core_count: usize, radix: usize, canonical_only: bool) -> Option<usize> {
    if canonical_only {
        // multisets of size C drawn from `radix` choices: C(radix + C - 1, C)
        let mut total: usize = 1;
        for i in 1..=core_count {
            total = total.checked_mul(radix + i - 1)? / i;
        }
        Some(total)
    } else {
        radix.checked_pow(u32::try_from(core_count).ok()?)
    }
}

/// Iterative mixed-radix counter over `core_count` digits.
///
/// With `monotone` set, a carry resets the lower digits to the carried digit
/// instead of zero, so only non-decreasing digit vectors are produced.
struct Odometer {
    digits: Vec<usize>,
    radix: usize,
    monotone: bool,
    done: bool,
}

impl Odometer {
    fn new(core_count: usize, radix: usize, monotone: bool) -> Self {
        Self {
            digits: vec![0; core_count],
            radix,
            monotone,
            done: radix == 0,
        }
    }

    fn advance(&mut self) {
        match self.digits.iter().rposition(|&d| d + 1 < self.radix) {
            Some(i) => {
                self.digits[i] += 1;
                let reset = if self.monotone { self.digits[i] } else { 0 };
                for d in &mut self.digits[i + 1..] {
                    *d = reset;
                }
            }
            None => self.done = true,
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.digits.clone();
        self.advance();
        Some(current)
    }
}
