//! Routing units into the five phases of a run.

use std::fmt;

use tracing::debug;

use crate::config::PhasesConfig;
use crate::filter::NameFilter;
use crate::unit::BoxedUnit;

/// The phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BeforeSeries,
    BeforeParallel,
    Main,
    AfterParallel,
    AfterSeries,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::BeforeSeries,
        Phase::BeforeParallel,
        Phase::Main,
        Phase::AfterParallel,
        Phase::AfterSeries,
    ];

    pub fn is_serial(self) -> bool {
        matches!(self, Phase::BeforeSeries | Phase::AfterSeries)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BeforeSeries => "Before Serial Run",
            Phase::BeforeParallel => "Before Parallel Run",
            Phase::Main => "Main Parallel Run",
            Phase::AfterParallel => "After Parallel Run",
            Phase::AfterSeries => "After Serial Run",
        };
        f.write_str(name)
    }
}

/// Units split by phase.
///
/// A unit goes to the first phase whose filter matches it, checked in the
/// order before-series, before-parallel, after-parallel, after-series;
/// everything else runs in the main phase. Serial phases are ordered by the
/// position of the filter entry that selected each unit.
#[derive(Default)]
pub struct PhasedUnits {
    pub before_series: Vec<BoxedUnit>,
    pub before_parallel: Vec<BoxedUnit>,
    pub main: Vec<BoxedUnit>,
    pub after_parallel: Vec<BoxedUnit>,
    pub after_series: Vec<BoxedUnit>,
}

impl PhasedUnits {
    pub fn assign(units: Vec<BoxedUnit>, config: &PhasesConfig) -> Self {
        let before_series = NameFilter::new(config.run_before_series.iter().cloned());
        let before_parallel = NameFilter::new(config.run_before_parallel.iter().cloned());
        let after_parallel = NameFilter::new(config.run_after_parallel.iter().cloned());
        let after_series = NameFilter::new(config.run_after_series.iter().cloned());

        let mut phased = Self::default();
        for unit in units {
            if unit.matches(&before_series) {
                phased.before_series.push(unit);
            } else if unit.matches(&before_parallel) {
                phased.before_parallel.push(unit);
            } else if unit.matches(&after_parallel) {
                phased.after_parallel.push(unit);
            } else if unit.matches(&after_series) {
                phased.after_series.push(unit);
            } else {
                phased.main.push(unit);
            }
        }

        sort_by_entry(&mut phased.before_series, &before_series);
        sort_by_entry(&mut phased.after_series, &after_series);

        debug!(
            "Phases: before series {}, before parallel {}, main {}, after parallel {}, after series {}",
            phased.before_series.len(),
            phased.before_parallel.len(),
            phased.main.len(),
            phased.after_parallel.len(),
            phased.after_series.len(),
        );
        phased
    }

    pub fn get(&self, phase: Phase) -> &[BoxedUnit] {
        match phase {
            Phase::BeforeSeries => &self.before_series,
            Phase::BeforeParallel => &self.before_parallel,
            Phase::Main => &self.main,
            Phase::AfterParallel => &self.after_parallel,
            Phase::AfterSeries => &self.after_series,
        }
    }

    pub fn take(&mut self, phase: Phase) -> Vec<BoxedUnit> {
        let units = match phase {
            Phase::BeforeSeries => &mut self.before_series,
            Phase::BeforeParallel => &mut self.before_parallel,
            Phase::Main => &mut self.main,
            Phase::AfterParallel => &mut self.after_parallel,
            Phase::AfterSeries => &mut self.after_series,
        };
        std::mem::take(units)
    }

    pub fn len(&self) -> usize {
        Phase::ALL.iter().map(|&phase| self.get(phase).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_by_entry(units: &mut [BoxedUnit], filter: &NameFilter) {
    units.sort_by_key(|unit| {
        filter
            .position(unit.file(), unit.method())
            .unwrap_or(usize::MAX)
    });
}
