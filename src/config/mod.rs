use crate::output::{ColorMode, OutputFormat};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub probe: Probe,
    #[serde(default)]
    pub sampling: Sampling,
    #[serde(default)]
    pub output: Output,
}

/// How the external measurement binary is invoked.
#[derive(Debug, Clone, Deserialize)]
pub struct Probe {
    /// Path to the latency2001 binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// CPU to allocate memory on.
    #[serde(default)]
    pub alloc_cpu: Option<usize>,
    /// CPU to run the measurement on.
    #[serde(default)]
    pub run_cpu: Option<usize>,
    #[serde(default)]
    pub large_pages: bool,
    /// Report latency in nanoseconds instead of processor cycles.
    #[serde(default)]
    pub report_time: bool,
    /// Wrap the binary in `setarch <machine> -R` to disable address space
    /// randomization.
    #[serde(default = "default_disable_aslr")]
    pub disable_aslr: bool,
    /// Minimum time the binary runs for each size. The binary takes whole
    /// seconds, so fractions are rounded up.
    #[serde(default, with = "humantime_serde")]
    pub min_runtime: Option<Duration>,
    /// Stride in bytes between pointer chain elements.
    #[serde(default)]
    pub stride: Option<u64>,
    /// TLB test mode.
    #[serde(default)]
    pub tlb: bool,
    /// Sequential access instead of a randomized chain.
    #[serde(default)]
    pub sequential: bool,
    /// Touch the end of cachelines instead of the start.
    #[serde(default)]
    pub end_of_line: bool,
    /// Leave hardware prefetch enabled.
    #[serde(default)]
    pub keep_prefetch: bool,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            alloc_cpu: None,
            run_cpu: None,
            large_pages: false,
            report_time: false,
            disable_aslr: default_disable_aslr(),
            min_runtime: None,
            stride: None,
            tlb: false,
            sequential: false,
            end_of_line: false,
            keep_prefetch: false,
        }
    }
}

fn default_binary() -> PathBuf {
    PathBuf::from("./latency2001")
}

fn default_disable_aslr() -> bool {
    true
}

/// Adaptive sampling parameters.
///
/// The sweep starts at `min_size` and doubles up to `max_size`. Each of the
/// `passes` refinement passes then bisects neighbouring sizes whose latency
/// differs by more than `threshold` (relative), as long as the midpoint is a
/// multiple of `alignment`.
#[derive(Debug, Clone, Deserialize)]
pub struct Sampling {
    #[serde(default = "default_min_size", with = "size_serde")]
    pub min_size: u64,
    #[serde(default = "default_max_size", with = "size_serde")]
    pub max_size: u64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_passes")]
    pub passes: usize,
    #[serde(default = "default_alignment", with = "size_serde")]
    pub alignment: u64,
    #[serde(default)]
    pub zero_latency: ZeroLatencyPolicy,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            threshold: default_threshold(),
            passes: default_passes(),
            alignment: default_alignment(),
            zero_latency: ZeroLatencyPolicy::default(),
        }
    }
}

fn default_min_size() -> u64 {
    1024
}

fn default_max_size() -> u64 {
    256 * 1024 * 1024
}

fn default_threshold() -> f64 {
    0.1
}

fn default_passes() -> usize {
    20
}

fn default_alignment() -> u64 {
    1024
}

/// What to do when the smaller of two neighbouring sizes measured a latency
/// of exactly zero, which makes the relative change undefined.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ZeroLatencyPolicy {
    /// Abort the run.
    #[default]
    Fail,
    /// Treat a step up from zero as an infinite change and refine it.
    Refine,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Output {
    /// Output format (csv, json, clean).
    #[serde(default, with = "output_format_serde")]
    pub format: OutputFormat,
    /// Color mode (auto, always, never).
    #[serde(default, with = "color_mode_serde")]
    pub color: ColorMode,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the sampling bounds and probe options for values that cannot
    /// produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sampling;
        if s.min_size == 0 {
            return Err(ConfigError::Invalid("min_size must be positive".into()));
        }
        if s.min_size > s.max_size {
            return Err(ConfigError::Invalid(format!(
                "min_size ({}) is larger than max_size ({})",
                s.min_size, s.max_size
            )));
        }
        if !s.threshold.is_finite() || s.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be a non-negative number, got {}",
                s.threshold
            )));
        }
        if s.alignment == 0 {
            return Err(ConfigError::Invalid("alignment must be positive".into()));
        }
        if self.probe.min_runtime == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("min_runtime must be positive".into()));
        }
        if self.probe.stride == Some(0) {
            return Err(ConfigError::Invalid("stride must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("command not found: {}", .0.display())]
    BinaryNotFound(PathBuf),
}

/// Resolve a command the way a shell would: paths containing a separator are
/// checked directly, bare names are looked up in `PATH`. Only executable
/// files match.
pub fn resolve_command(command: &Path) -> Result<PathBuf, ConfigError> {
    which::which(command).map_err(|_| ConfigError::BinaryNotFound(command.to_path_buf()))
}

/// Like [`resolve_command`], with an explicit search path and working
/// directory for relative paths.
pub fn resolve_command_in<P: AsRef<OsStr>>(
    command: &Path,
    paths: Option<P>,
    cwd: &Path,
) -> Result<PathBuf, ConfigError> {
    which::which_in(command, paths, cwd)
        .map_err(|_| ConfigError::BinaryNotFound(command.to_path_buf()))
}

/// Parse a byte size with an optional binary suffix.
///
/// Examples:
/// - "4096" -> 4096
/// - "4k" -> 4096
/// - "256M" -> 268435456
/// - "1GiB" -> 1073741824
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }

    let (num, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));

    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid size: {}", s))?;

    let shift = match suffix.trim().to_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        other => return Err(format!("unknown size unit: {other}")),
    };

    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size out of range: {}", s))
}



/// Sizes may be written as integers or as strings with a unit suffix.
mod size_serde {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Bytes(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawSize::deserialize(deserializer)? {
            RawSize::Bytes(n) => Ok(n),
            RawSize::Text(s) => super::parse_size(&s).map_err(serde::de::Error::custom),
        }
    }
}

mod output_format_serde {
    use crate::output::OutputFormat;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod color_mode_serde {
    use crate::output::ColorMode;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ColorMode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
