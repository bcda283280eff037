//! Adaptive working-set sampling.
//!
//! The sampler runs a coarse power-of-two sweep from `min_size` to
//! `max_size`, then makes a bounded number of refinement passes that bisect
//! neighbouring sizes whose latency differs by more than the configured
//! threshold. Midpoints that are not a multiple of the alignment are skipped,
//! which bounds how deep the bisection can go.

use crate::config::{Sampling, ZeroLatencyPolicy};
use crate::output::OutputFormatter;
use crate::probe::{Probe, ProbeError};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A single measured point on the latency curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Working-set size in bytes.
    pub size: u64,
    /// Latency in cycles or nanoseconds.
    pub latency: f64,
}

/// Observations keyed by size, iterated in ascending size order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    samples: BTreeMap<u64, f64>,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an observation. A size that was already measured keeps its
    /// first latency and `false` is returned.
    pub fn insert(&mut self, size: u64, latency: f64) -> bool {
        if self.samples.contains_key(&size) {
            return false;
        }
        self.samples.insert(size, latency);
        true
    }

    pub fn contains(&self, size: u64) -> bool {
        self.samples.contains_key(&size)
    }

    pub fn get(&self, size: u64) -> Option<f64> {
        self.samples.get(&size).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.samples
            .iter()
            .map(|(&size, &latency)| Observation { size, latency })
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.samples.keys().copied().collect()
    }
}

impl FromIterator<(u64, f64)> for SampleSet {
    fn from_iter<I: IntoIterator<Item = (u64, f64)>>(iter: I) -> Self {
        let mut set = SampleSet::new();
        for (size, latency) in iter {
            set.insert(size, latency);
        }
        set
    }
}

/// Which part of the run a probe belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sweep,
    Refine,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Sweep => "sweep",
            Phase::Refine => "refine",
        }
    }
}

/// Counters describing a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Probes issued by the coarse sweep.
    pub sweep_probes: usize,
    /// Probes issued by refinement passes.
    pub refine_probes: usize,
    /// Refinement passes executed (including the final one that found
    /// nothing to refine).
    pub passes: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_probes(&self) -> usize {
        self.sweep_probes + self.refine_probes
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("no sizes between min_size {min_size} and max_size {max_size}")]
    EmptySweep { min_size: u64, max_size: u64 },
    #[error(
        "size {prev_size} measured zero latency, relative change to size {size} is undefined"
    )]
    ZeroLatency { prev_size: u64, size: u64 },
    #[error("alignment must be positive")]
    ZeroAlignment,
}

/// Owns the sample set and drives the probe through both phases.
pub struct Sampler {
    config: Sampling,
    samples: SampleSet,
    sweep_probes: usize,
    refine_probes: usize,
    passes: usize,
}

impl Sampler {
    pub fn new(config: Sampling) -> Self {
        Self::with_samples(config, SampleSet::new())
    }

    /// Start from previously collected samples. The coarse sweep still runs
    /// but does not measure sizes that are already present.
    pub fn with_samples(config: Sampling, samples: SampleSet) -> Self {
        Self {
            config,
            samples,
            sweep_probes: 0,
            refine_probes: 0,
            passes: 0,
        }
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    pub fn into_samples(self) -> SampleSet {
        self.samples
    }

    /// Run the coarse sweep followed by up to `passes` refinement passes.
    ///
    /// Any error aborts the run immediately.
    pub fn run(
        &mut self,
        probe: &mut dyn Probe,
        formatter: &dyn OutputFormatter,
    ) -> Result<RunSummary, SampleError> {
        self.check_alignment()?;
        let start = Instant::now();

        tracing::info!(
            min_size = self.config.min_size,
            max_size = self.config.max_size,
            "starting coarse sweep"
        );
        self.coarse_sweep(probe, formatter)?;

        tracing::info!(
            samples = self.samples.len(),
            passes = self.config.passes,
            threshold = self.config.threshold,
            "starting refinement"
        );
        for pass in 1..=self.config.passes {
            let inserted = self.refine_pass(probe, formatter)?;
            self.passes = pass;
            formatter.print_pass(pass, inserted);

            if inserted == 0 {
                tracing::debug!(pass, "nothing left to refine, skipping remaining passes");
                break;
            }
        }

        let summary = RunSummary {
            sweep_probes: self.sweep_probes,
            refine_probes: self.refine_probes,
            passes: self.passes,
            elapsed: start.elapsed(),
        };
        tracing::info!(
            samples = self.samples.len(),
            probes = summary.total_probes(),
            passes = summary.passes,
            "sampling complete"
        );
        Ok(summary)
    }

    /// Measure `min_size`, `2 * min_size`, ... up to and including the largest
    /// such size not above `max_size`.
    ///
    /// Returns the number of sizes visited.
    pub fn coarse_sweep(
        &mut self,
        probe: &mut dyn Probe,
        formatter: &dyn OutputFormatter,
    ) -> Result<usize, SampleError> {
        let mut visited = 0;
        let mut size = self.config.min_size;

        while size > 0 && size <= self.config.max_size {
            if !self.samples.contains(size) {
                formatter.print_probe(size, Phase::Sweep);
                let latency = probe.measure(size)?;
                self.sweep_probes += 1;
                self.samples.insert(size, latency);
            }
            visited += 1;

            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }

        if visited == 0 {
            return Err(SampleError::EmptySweep {
                min_size: self.config.min_size,
                max_size: self.config.max_size,
            });
        }

        Ok(visited)
    }

    /// Make one refinement pass over the samples as they were at the start
    /// of the pass. Points inserted here are only compared in the next pass.
    ///
    /// Returns the number of new samples.
    pub fn refine_pass(
        &mut self,
        probe: &mut dyn Probe,
        formatter: &dyn OutputFormatter,
    ) -> Result<usize, SampleError> {
        self.check_alignment()?;
        let snapshot: Vec<Observation> = self.samples.iter().collect();
        let mut inserted = 0;

        for pair in snapshot.windows(2) {
            let Some(size) = self.candidate(pair[0], pair[1])? else {
                continue;
            };

            formatter.print_probe(size, Phase::Refine);
            let latency = probe.measure(size)?;
            self.refine_probes += 1;
            if self.samples.insert(size, latency) {
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    fn check_alignment(&self) -> Result<(), SampleError> {
        if self.config.alignment == 0 {
            return Err(SampleError::ZeroAlignment);
        }
        Ok(())
    }

    /// The size to measure between two neighbouring observations, if any.
    pub fn candidate(
        &self,
        prev: Observation,
        next: Observation,
    ) -> Result<Option<u64>, SampleError> {
        let diff = relative_change(prev, next, self.config.zero_latency)?;
        if diff.abs() <= self.config.threshold {
            return Ok(None);
        }

        let size = midpoint(prev.size, next.size);
        let remainder = size
            .checked_rem(self.config.alignment)
            .ok_or(SampleError::ZeroAlignment)?;
        if remainder != 0 {
            tracing::debug!(
                prev = prev.size,
                next = next.size,
                candidate = size,
                "midpoint not aligned, skipping"
            );
            return Ok(None);
        }
        if size <= prev.size || self.samples.contains(size) {
            return Ok(None);
        }

        tracing::debug!(
            prev = prev.size,
            next = next.size,
            candidate = size,
            diff,
            "refining"
        );
        Ok(Some(size))
    }
}

/// `prev + (next - prev) / 2`, rounded down.
pub fn midpoint(prev: u64, next: u64) -> u64 {
    prev + (next - prev) / 2
}

/// Relative latency change from `prev` to `next`.
///
/// A zero `prev` latency is resolved by `policy`: `Fail` reports
/// [`SampleError::ZeroLatency`], `Refine` yields an infinite change for a step
/// up from zero and no change for zero to zero.
pub fn relative_change(
    prev: Observation,
    next: Observation,
    policy: ZeroLatencyPolicy,
) -> Result<f64, SampleError> {
    if prev.latency == 0.0 {
        return match policy {
            ZeroLatencyPolicy::Fail => Err(SampleError::ZeroLatency {
                prev_size: prev.size,
                size: next.size,
            }),
            ZeroLatencyPolicy::Refine if next.latency == 0.0 => Ok(0.0),
            ZeroLatencyPolicy::Refine => Ok(f64::INFINITY),
        };
    }
    Ok((next.latency - prev.latency) / prev.latency)
}
