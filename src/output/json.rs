//! JSON (NDJSON) formatter for machine-readable output.

use super::OutputFormatter;
use crate::config::Config;
use crate::sampler::{Phase, RunSummary, SampleSet};
use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};

/// JSON formatter outputting NDJSON (newline-delimited JSON).
///
/// Config and progress lines go to stderr, observations and the summary to
/// the report sink.
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ConfigOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    binary: String,
    unit: &'static str,
    min_size: u64,
    max_size: u64,
    threshold: f64,
    passes: usize,
    alignment: u64,
    large_pages: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    alloc_cpu: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_cpu: Option<usize>,
}

#[derive(Serialize)]
struct ProbeOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    ts: String,
    phase: &'static str,
    size: u64,
}

#[derive(Serialize)]
struct PassOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    pass: usize,
    inserted: usize,
}

#[derive(Serialize)]
struct ObservationOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    size: u64,
    latency: f64,
}

#[derive(Serialize)]
struct SummaryOutput {
    #[serde(rename = "type")]
    msg_type: &'static str,
    ts: String,
    samples: usize,
    sweep_probes: usize,
    refine_probes: usize,
    passes: usize,
    elapsed_secs: f64,
}

/// Round to two decimals, matching the CSV report.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl OutputFormatter for JsonFormatter {
    fn print_config(&self, config: &Config) {
        let output = ConfigOutput {
            msg_type: "config",
            binary: config.probe.binary.display().to_string(),
            unit: if config.probe.report_time {
                "ns"
            } else {
                "cycles"
            },
            min_size: config.sampling.min_size,
            max_size: config.sampling.max_size,
            threshold: config.sampling.threshold,
            passes: config.sampling.passes,
            alignment: config.sampling.alignment,
            large_pages: config.probe.large_pages,
            alloc_cpu: config.probe.alloc_cpu,
            run_cpu: config.probe.run_cpu,
        };
        if let Ok(json) = serde_json::to_string(&output) {
            eprintln!("{}", json);
        }
    }

    fn print_probe(&self, size: u64, phase: Phase) {
        let output = ProbeOutput {
            msg_type: "probe",
            ts: timestamp(),
            phase: phase.as_str(),
            size,
        };
        if let Ok(json) = serde_json::to_string(&output) {
            eprintln!("{}", json);
        }
    }

    fn print_pass(&self, pass: usize, inserted: usize) {
        let output = PassOutput {
            msg_type: "pass",
            pass,
            inserted,
        };
        if let Ok(json) = serde_json::to_string(&output) {
            eprintln!("{}", json);
        }
    }

    fn print_report(
        &self,
        out: &mut dyn Write,
        samples: &SampleSet,
        summary: &RunSummary,
    ) -> io::Result<()> {
        for obs in samples.iter() {
            let output = ObservationOutput {
                msg_type: "observation",
                size: obs.size,
                latency: round2(obs.latency),
            };
            serde_json::to_writer(&mut *out, &output)?;
            writeln!(out)?;
        }

        let output = SummaryOutput {
            msg_type: "summary",
            ts: timestamp(),
            samples: samples.len(),
            sweep_probes: summary.sweep_probes,
            refine_probes: summary.refine_probes,
            passes: summary.passes,
            elapsed_secs: summary.elapsed.as_secs_f64(),
        };
        serde_json::to_writer(&mut *out, &output)?;
        writeln!(out)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_report_lines() {
        let samples: SampleSet = [(2048, 12.346), (1024, 4.0)].into_iter().collect();
        let summary = RunSummary {
            sweep_probes: 2,
            refine_probes: 0,
            passes: 1,
            elapsed: Duration::from_millis(1500),
        };

        let mut out = Vec::new();
        JsonFormatter::new()
            .print_report(&mut out, &samples, &summary)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "observation");
        assert_eq!(lines[0]["size"], 1024);
        assert_eq!(lines[0]["latency"], 4.0);
        assert_eq!(lines[1]["size"], 2048);
        assert_eq!(lines[1]["latency"], 12.35);
        assert_eq!(lines[2]["type"], "summary");
        assert_eq!(lines[2]["samples"], 2);
        assert_eq!(lines[2]["passes"], 1);
        assert_eq!(lines[2]["elapsed_secs"], 1.5);
    }
}
