//! Clean table formatter with optional color output.

use super::format::{format_bytes, format_change, format_elapsed, padded};
use super::{ColorMode, OutputFormatter};
use crate::config::{Config, ZeroLatencyPolicy};
use crate::sampler::{Observation, Phase, RunSummary, SampleSet, relative_change};
use std::io::{self, IsTerminal, Write};

/// ANSI escape codes for colors.
mod ansi {
    pub const RED: &str = "\x1b[31m";
    pub const RESET: &str = "\x1b[0m";
}

/// Clean table formatter with optional color support.
///
/// Rows where latency changed by more than the refinement threshold since the
/// previous size are highlighted.
pub struct CleanFormatter {
    use_color: bool,
    threshold: f64,
}

impl CleanFormatter {
    pub fn new(color_mode: ColorMode, threshold: f64) -> Self {
        let use_color = match color_mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => {
                // Check if stdout is a TTY and NO_COLOR is not set
                io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err()
            }
        };
        Self {
            use_color,
            threshold,
        }
    }

    fn red(&self, s: &str) -> String {
        if self.use_color {
            format!("{}{}{}", ansi::RED, s, ansi::RESET)
        } else {
            s.to_string()
        }
    }

    fn maybe_red(&self, s: &str, condition: bool) -> String {
        if condition {
            self.red(s)
        } else {
            s.to_string()
        }
    }

    fn row(&self, prev: Option<Observation>, obs: Observation) -> String {
        let change = prev.and_then(|p| relative_change(p, obs, ZeroLatencyPolicy::Refine).ok());
        let change_str = match change {
            Some(c) => padded(&format_change(c), 8),
            None => padded("-", 8),
        };
        let steep = change.is_some_and(|c| c.abs() > self.threshold);

        format!(
            "{:>12} │ {:>7} │ {:>10.2} │ {}",
            obs.size,
            format_bytes(obs.size),
            obs.latency,
            self.maybe_red(&change_str, steep)
        )
    }
}

impl OutputFormatter for CleanFormatter {
    fn print_config(&self, config: &Config) {
        eprintln!("latsweep");
        eprintln!("──────────────────");

        let wrapper = if config.probe.disable_aslr {
            " (setarch -R)"
        } else {
            ""
        };
        eprintln!("binary     {}{}", config.probe.binary.display(), wrapper);
        eprintln!(
            "range      {} - {}",
            format_bytes(config.sampling.min_size),
            format_bytes(config.sampling.max_size)
        );
        eprintln!(
            "refine     {} passes, >{}% change, {} aligned",
            config.sampling.passes,
            config.sampling.threshold * 100.0,
            format_bytes(config.sampling.alignment)
        );

        // CPU line (optional)
        match (config.probe.alloc_cpu, config.probe.run_cpu) {
            (None, None) => {}
            (alloc, run) => {
                let show = |cpu: Option<usize>| cpu.map_or("any".to_string(), |c| c.to_string());
                eprintln!("cpus       alloc {}, run {}", show(alloc), show(run));
            }
        }

        let unit = if config.probe.report_time {
            "ns"
        } else {
            "cycles"
        };
        let pages = if config.probe.large_pages {
            ", large pages"
        } else {
            ""
        };
        eprintln!("unit       {}{}", unit, pages);
        eprintln!();
    }

    fn print_probe(&self, size: u64, phase: Phase) {
        eprintln!("[{:<6}] {:>12} ({})", phase.as_str(), size, format_bytes(size));
    }

    fn print_pass(&self, pass: usize, inserted: usize) {
        eprintln!("[pass {}: {} new]", pass, inserted);
    }

    fn print_report(
        &self,
        out: &mut dyn Write,
        samples: &SampleSet,
        summary: &RunSummary,
    ) -> io::Result<()> {
        writeln!(out, "        size │   bytes │    latency │   change")?;
        writeln!(out, "─────────────┼─────────┼────────────┼─────────")?;

        let mut prev = None;
        for obs in samples.iter() {
            writeln!(out, "{}", self.row(prev, obs))?;
            prev = Some(obs);
        }

        writeln!(out)?;
        writeln!(
            out,
            "{} samples, {} probes ({} sweep, {} refine), {} passes in {}",
            samples.len(),
            summary.total_probes(),
            summary.sweep_probes,
            summary.refine_probes,
            summary.passes,
            format_elapsed(summary.elapsed)
        )?;
        out.flush()
    }
}
