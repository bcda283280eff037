pub mod config;
pub mod output;
pub mod probe;
pub mod sampler;

pub use config::{Config, ConfigError, ZeroLatencyPolicy, parse_size};
pub use output::{
    ColorMode, OutputFormat, OutputFormatter, ReportParseError, create_formatter, parse_report,
};
pub use probe::{CommandProbe, Probe, ProbeError};
pub use sampler::{Observation, Phase, RunSummary, SampleError, SampleSet, Sampler};
