//! Output formatting for sweep results.
//!
//! Provides multiple output formats:
//! - Csv: `size,latency` rows, the input format of the plotting script
//! - Json: NDJSON format for machine parsing
//! - Clean: Human-readable table format with colors
//!
//! Progress (the sizes being probed) always goes to stderr so the report on
//! stdout stays a clean data stream. The report is only written once the
//! whole run has succeeded.

mod clean;
mod csv;
pub mod format;
mod json;

pub use self::csv::{CsvFormatter, ReportParseError, parse_report};
pub use clean::CleanFormatter;
pub use json::JsonFormatter;

use crate::config::Config;
use crate::sampler::{Phase, RunSummary, SampleSet};
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// `size,latency` rows (default).
    #[default]
    Csv,
    /// NDJSON format for machine parsing.
    Json,
    /// Clean table format with colors.
    Clean,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            "clean" => Ok(OutputFormat::Clean),
            _ => Err(format!(
                "invalid format '{}', expected: csv, json, clean",
                s
            )),
        }
    }
}

/// Color mode selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// Auto-detect based on TTY and NO_COLOR env var (default).
    #[default]
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

impl std::str::FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ColorMode::Auto),
            "always" => Ok(ColorMode::Always),
            "never" => Ok(ColorMode::Never),
            _ => Err(format!(
                "invalid color mode '{}', expected: auto, always, never",
                s
            )),
        }
    }
}

/// Trait for output formatters.
pub trait OutputFormatter: Send + Sync {
    /// Print the configuration summary at startup.
    fn print_config(&self, config: &Config);

    /// Print the size about to be probed.
    fn print_probe(&self, size: u64, phase: Phase);

    /// Print the outcome of a refinement pass.
    fn print_pass(&self, _pass: usize, _inserted: usize) {}

    /// Write the final report.
    fn print_report(
        &self,
        out: &mut dyn Write,
        samples: &SampleSet,
        summary: &RunSummary,
    ) -> io::Result<()>;
}

/// Create a formatter based on the output format and color mode.
///
/// `threshold` is the refinement threshold, used to highlight steep steps.
pub fn create_formatter(
    format: OutputFormat,
    color: ColorMode,
    threshold: f64,
) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Csv => Box::new(CsvFormatter::new()),
        OutputFormat::Json => Box::new(JsonFormatter::new()),
        OutputFormat::Clean => Box::new(CleanFormatter::new(color, threshold)),
    }
}
