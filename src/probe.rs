//! Latency probes.
//!
//! A probe measures the load latency for a single working-set size. The
//! production probe runs the external `latency2001` binary once per size and
//! reads the last row of its CSV output.

use crate::config::{self, ConfigError};
use std::path::PathBuf;
use std::process::{Command, Output};

/// Something that can measure the latency of one working-set size.
///
/// Calls are strictly sequential: a measurement is sensitive to the cache and
/// TLB state left behind by the previous one.
pub trait Probe {
    /// Measure the latency for `size` bytes, in cycles or nanoseconds.
    fn measure(&mut self, size: u64) -> Result<f64, ProbeError>;
}

impl<F> Probe for F
where
    F: FnMut(u64) -> Result<f64, ProbeError>,
{
    fn measure(&mut self, size: u64) -> Result<f64, ProbeError> {
        self(size)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run `{command}` for size {size}: {source}")]
    Spawn {
        size: u64,
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed for size {size} ({status}): {stderr}")]
    Exit {
        size: u64,
        command: String,
        status: String,
        stderr: String,
    },
    #[error("`{command}` produced no result row for size {size}")]
    NoOutput { size: u64, command: String },
    #[error("`{command}` produced unreadable output for size {size}: {reason}")]
    Malformed {
        size: u64,
        command: String,
        reason: String,
    },
    #[error("`{command}` result row for size {size} has no {field} field")]
    MissingField {
        size: u64,
        command: String,
        field: &'static str,
    },
    #[error("`{command}` reported an invalid {field} value {value:?} for size {size}")]
    Parse {
        size: u64,
        command: String,
        field: &'static str,
        value: String,
    },
}

/// Which column of the `size,cycles,ns` row to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyField {
    Cycles,
    Nanoseconds,
}

impl LatencyField {
    fn index(self) -> usize {
        match self {
            LatencyField::Cycles => 1,
            LatencyField::Nanoseconds => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            LatencyField::Cycles => "cycles",
            LatencyField::Nanoseconds => "ns",
        }
    }
}

/// Probe that runs the external measurement binary.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    /// Leading program and arguments, everything except the size.
    program: PathBuf,
    args: Vec<String>,
    field: LatencyField,
}

impl CommandProbe {
    /// Build a probe from configuration, resolving the binary and, when
    /// address randomization is disabled, the `setarch` wrapper.
    pub fn new(probe: &config::Probe) -> Result<Self, ConfigError> {
        let binary = config::resolve_command(&probe.binary)?;

        let wrapper = if probe.disable_aslr {
            let setarch = config::resolve_command("setarch".as_ref())?;
            let machine = machine_name()?;
            Some((setarch, machine))
        } else {
            None
        };

        Ok(Self::with_parts(probe, binary, wrapper))
    }

    fn with_parts(
        probe: &config::Probe,
        binary: PathBuf,
        wrapper: Option<(PathBuf, String)>,
    ) -> Self {
        let mut args = Vec::new();

        let program = match wrapper {
            Some((setarch, machine)) => {
                args.push(machine);
                args.push("-R".to_string());
                args.push(binary.display().to_string());
                setarch
            }
            None => binary,
        };

        args.push("-C".to_string());
        if probe.large_pages {
            args.push("-l".to_string());
        }
        if let Some(cpu) = probe.alloc_cpu {
            args.push("-a".to_string());
            args.push(cpu.to_string());
        }
        if let Some(cpu) = probe.run_cpu {
            args.push("-c".to_string());
            args.push(cpu.to_string());
        }
        if let Some(runtime) = probe.min_runtime {
            args.push("-t".to_string());
            // Whole seconds only; round up so the run is never shorter.
            let secs = runtime.as_secs() + u64::from(runtime.subsec_nanos() > 0);
            args.push(secs.to_string());
        }
        if let Some(stride) = probe.stride {
            args.push("-s".to_string());
            args.push(stride.to_string());
        }
        if probe.tlb {
            args.push("-T".to_string());
        }
        if probe.sequential {
            args.push("-S".to_string());
        }
        if probe.end_of_line {
            args.push("-e".to_string());
        }
        if probe.keep_prefetch {
            args.push("-p".to_string());
        }

        let field = if probe.report_time {
            LatencyField::Nanoseconds
        } else {
            LatencyField::Cycles
        };

        Self {
            program,
            args,
            field,
        }
    }

    /// Full argument vector for `size`, excluding the program itself.
    pub fn args_for(&self, size: u64) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(size.to_string());
        args
    }

    /// The command line for `size`, as it would be typed in a shell.
    pub fn command_line(&self, size: u64) -> String {
        let mut line = self.program.display().to_string();
        for arg in self.args_for(size) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    fn check_output(&self, size: u64, command: &str, output: &Output) -> Result<f64, ProbeError> {
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::warn!(size, "latency2001: {}", line.trim());
        }

        if !output.status.success() {
            return Err(ProbeError::Exit {
                size,
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        parse_result(&output.stdout, self.field, size, command)
    }
}

impl Probe for CommandProbe {
    fn measure(&mut self, size: u64) -> Result<f64, ProbeError> {
        let command = self.command_line(size);
        tracing::debug!(size, "running {}", command);

        let output = Command::new(&self.program)
            .args(self.args_for(size))
            .output()
            .map_err(|source| ProbeError::Spawn {
                size,
                command: command.clone(),
                source,
            })?;

        self.check_output(size, &command, &output)
    }
}

/// Extract the latency from the last CSV row of the binary's output.
///
/// Header rows and any earlier rows are ignored.
pub fn parse_result(
    stdout: &[u8],
    field: LatencyField,
    size: u64,
    command: &str,
) -> Result<f64, ProbeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(stdout);

    let mut last = None;
    for record in reader.records() {
        // A malformed row anywhere means the output cannot be trusted.
        let record = record.map_err(|e| ProbeError::Malformed {
            size,
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        if record.iter().any(|f| !f.is_empty()) {
            last = Some(record);
        }
    }

    let record = last.ok_or_else(|| ProbeError::NoOutput {
        size,
        command: command.to_string(),
    })?;

    let raw = record
        .get(field.index())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProbeError::MissingField {
            size,
            command: command.to_string(),
            field: field.name(),
        })?;

    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(ProbeError::Parse {
            size,
            command: command.to_string(),
            field: field.name(),
            value: raw.to_string(),
        }),
    }
}

/// Machine hardware name as reported by `uname -m`, which is what `setarch`
/// expects as its architecture argument.
fn machine_name() -> Result<String, ConfigError> {
    let uname = config::resolve_command("uname".as_ref())?;
    let output = Command::new(&uname)
        .arg("-m")
        .output()
        .map_err(|e| ConfigError::Invalid(format!("failed to run uname -m: {}", e)))?;

    let machine = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || machine.is_empty() {
        return Err(ConfigError::Invalid(
            "uname -m did not report a machine name".to_string(),
        ));
    }
    Ok(machine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn probe_config() -> config::Probe {
        config::Probe {
            disable_aslr: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_command_line() {
        let probe = CommandProbe::with_parts(&probe_config(), PathBuf::from("./latency2001"), None);
        assert_eq!(probe.args_for(4096), vec!["-C", "4096"]);
        assert_eq!(probe.command_line(4096), "./latency2001 -C 4096");
        assert_eq!(probe.field, LatencyField::Cycles);
    }

    #[test]
    fn test_full_command_line() {
        let config = config::Probe {
            alloc_cpu: Some(0),
            run_cpu: Some(8),
            large_pages: true,
            report_time: true,
            min_runtime: Some(Duration::from_secs(3)),
            stride: Some(256),
            tlb: true,
            sequential: true,
            end_of_line: true,
            keep_prefetch: true,
            ..probe_config()
        };
        let probe = CommandProbe::with_parts(
            &config,
            PathBuf::from("/opt/latency2001"),
            Some((PathBuf::from("/usr/bin/setarch"), "ppc64le".to_string())),
        );

        assert_eq!(
            probe.command_line(1024),
            "/usr/bin/setarch ppc64le -R /opt/latency2001 -C -l -a 0 -c 8 -t 3 -s 256 -T -S -e -p 1024"
        );
        assert_eq!(probe.field, LatencyField::Nanoseconds);
    }

    #[test]
    fn test_fractional_runtime_rounds_up() {
        for (runtime, expected) in [
            (Duration::from_millis(200), "1"),
            (Duration::from_millis(2500), "3"),
            (Duration::from_secs(2), "2"),
        ] {
            let config = config::Probe {
                min_runtime: Some(runtime),
                ..probe_config()
            };
            let probe = CommandProbe::with_parts(&config, PathBuf::from("lat"), None);
            assert_eq!(probe.args_for(1), vec!["-C", "-t", expected, "1"]);
        }
    }

    #[test]
    fn test_runtime_from_config_file() {
        let config = config::Config::from_toml("[probe]\nmin_runtime = \"2500ms\"").unwrap();
        let probe = CommandProbe::with_parts(&config.probe, PathBuf::from("lat"), None);
        assert_eq!(probe.args_for(1), vec!["-C", "-t", "3", "1"]);
    }

    #[test]
    fn test_parse_last_row_wins() {
        let out = b"size,cycles,ns\n1024,10.00,3.00\n2048,12.50,4.25\n";
        assert_eq!(
            parse_result(out, LatencyField::Cycles, 2048, "lat").unwrap(),
            12.5
        );
        assert_eq!(
            parse_result(out, LatencyField::Nanoseconds, 2048, "lat").unwrap(),
            4.25
        );
    }

    #[test]
    fn test_parse_ignores_trailing_blank_lines() {
        let out = b"size,cycles,ns\n4096, 7.00, 2.10\n\n\n";
        assert_eq!(
            parse_result(out, LatencyField::Cycles, 4096, "lat").unwrap(),
            7.0
        );
    }

    #[test]
    fn test_parse_no_output() {
        assert!(matches!(
            parse_result(b"", LatencyField::Cycles, 1024, "lat"),
            Err(ProbeError::NoOutput { size: 1024, .. })
        ));
    }

    #[test]
    fn test_parse_missing_field() {
        let out = b"size,cycles,ns\n1024,10.00\n";
        assert!(matches!(
            parse_result(out, LatencyField::Nanoseconds, 1024, "lat"),
            Err(ProbeError::MissingField { field: "ns", .. })
        ));
        assert!(parse_result(out, LatencyField::Cycles, 1024, "lat").is_ok());
    }

    #[test]
    fn test_parse_header_only_is_invalid() {
        // The header is the last row, so its "cycles" label is the value.
        let out = b"size,cycles,ns\n";
        assert!(matches!(
            parse_result(out, LatencyField::Cycles, 1024, "lat"),
            Err(ProbeError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_negative_and_nan() {
        for out in [&b"1024,-1.0,2.0\n"[..], &b"1024,NaN,2.0\n"[..]] {
            assert!(matches!(
                parse_result(out, LatencyField::Cycles, 1024, "lat"),
                Err(ProbeError::Parse { .. })
            ));
        }
    }

    #[test]
    fn test_parse_invalid_utf8_keeps_reason() {
        let out = b"size,cycles,ns\n1024,\xff\xfe,1.0\n";
        match parse_result(out, LatencyField::Cycles, 1024, "lat") {
            Err(ProbeError::Malformed { size, reason, .. }) => {
                assert_eq!(size, 1024);
                assert!(!reason.is_empty());
            }
            other => panic!("expected malformed output, got {:?}", other),
        }
    }

    #[test]
    fn test_error_carries_context() {
        let err = parse_result(b"", LatencyField::Cycles, 65536, "./latency2001 -C 65536")
            .unwrap_err()
            .to_string();
        assert!(err.contains("65536"));
        assert!(err.contains("./latency2001 -C"));
    }

    #[test]
    fn test_closure_probe() {
        let mut calls = 0;
        let mut probe = |size: u64| {
            calls += 1;
            Ok::<f64, ProbeError>(size as f64 / 2.0)
        };
        assert_eq!(probe.measure(2048).unwrap(), 1024.0);
        assert_eq!(calls, 1);
    }

    #[cfg(unix)]
    mod script {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        fn script(body: &str) -> tempfile::TempPath {
            let mut file = tempfile::Builder::new()
                .prefix("fake-latency")
                .tempfile()
                .unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            write!(file, "{}", body).unwrap();
            let path = file.into_temp_path();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn probe_for(path: &std::path::Path, report_time: bool) -> CommandProbe {
            let config = config::Probe {
                binary: path.to_path_buf(),
                report_time,
                ..probe_config()
            };
            CommandProbe::new(&config).unwrap()
        }

        #[test]
        fn test_runs_binary_with_size() {
            // Echo the size back as cycles and half of it as ns.
            let path = script(
                "for last; do :; done\n\
                 echo size,cycles,ns\n\
                 echo \"$last,$last.00,$(($last / 2)).00\"\n",
            );
            let mut cycles = probe_for(&path, false);
            assert_eq!(cycles.measure(8192).unwrap(), 8192.0);

            let mut time = probe_for(&path, true);
            assert_eq!(time.measure(8192).unwrap(), 4096.0);
        }

        #[test]
        fn test_non_zero_exit() {
            let path = script("echo 'Size must be a multiple of 8x skip' >&2\nexit 1\n");
            let mut probe = probe_for(&path, false);
            match probe.measure(100) {
                Err(ProbeError::Exit { size, stderr, .. }) => {
                    assert_eq!(size, 100);
                    assert!(stderr.contains("multiple of 8x skip"));
                }
                other => panic!("expected exit error, got {:?}", other),
            }
        }

        #[test]
        fn test_empty_output() {
            let path = script("exit 0\n");
            let mut probe = probe_for(&path, false);
            assert!(matches!(
                probe.measure(1024),
                Err(ProbeError::NoOutput { .. })
            ));
        }

        #[test]
        fn test_missing_binary() {
            let config = config::Probe {
                binary: PathBuf::from("/nonexistent/latency2001"),
                ..probe_config()
            };
            assert!(matches!(
                CommandProbe::new(&config),
                Err(ConfigError::BinaryNotFound(_))
            ));
        }
    }
}
