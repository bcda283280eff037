//! CSV formatter, the input format of the plotting script.

use super::OutputFormatter;
use crate::config::Config;
use crate::sampler::{Observation, Phase, RunSummary, SampleSet};
use std::io::{self, Write};

/// Writes `size,latency` rows with two decimals and no header. Progress is
/// one size per line on stderr.
pub struct CsvFormatter;

impl CsvFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFormatter for CsvFormatter {
    fn print_config(&self, _config: &Config) {
        // CSV output doesn't print config
    }

    fn print_probe(&self, size: u64, _phase: Phase) {
        eprintln!("{}", size);
    }

    fn print_report(
        &self,
        out: &mut dyn Write,
        samples: &SampleSet,
        _summary: &RunSummary,
    ) -> io::Result<()> {
        for obs in samples.iter() {
            writeln!(out, "{},{:.2}", obs.size, obs.latency)?;
        }
        out.flush()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportParseError {
    #[error("malformed report: {0}")]
    Csv(String),
    #[error("line {line}: {reason}")]
    Row { line: u64, reason: String },
}

/// Parse a CSV report back into observations, in file order.
pub fn parse_report(text: &str) -> Result<Vec<Observation>, ReportParseError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes());

    let mut observations = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ReportParseError::Csv(e.to_string()))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != 2 {
            return Err(ReportParseError::Row {
                line,
                reason: format!("expected 2 fields, found {}", record.len()),
            });
        }
        let size = record[0].parse::<u64>().map_err(|_| ReportParseError::Row {
            line,
            reason: format!("invalid size {:?}", &record[0]),
        })?;
        let latency = record[1].parse::<f64>().map_err(|_| ReportParseError::Row {
            line,
            reason: format!("invalid latency {:?}", &record[1]),
        })?;

        observations.push(Observation { size, latency });
    }

    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> SampleSet {
        [(4096, 7.257), (1024, 4.0), (2048, 4.004), (3072, 5.5)]
            .into_iter()
            .collect()
    }

    fn report(samples: &SampleSet) -> String {
        let mut out = Vec::new();
        CsvFormatter::new()
            .print_report(&mut out, samples, &RunSummary::default())
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_rows_ascending_two_decimals() {
        assert_eq!(
            report(&samples()),
            "1024,4.00\n2048,4.00\n3072,5.50\n4096,7.26\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let samples = samples();
        let parsed = parse_report(&report(&samples)).unwrap();

        assert_eq!(parsed.len(), samples.len());
        assert!(parsed.windows(2).all(|w| w[0].size < w[1].size));
        for (parsed, original) in parsed.iter().zip(samples.iter()) {
            assert_eq!(parsed.size, original.size);
            assert!((parsed.latency - original.latency).abs() <= 0.005 + 1e-9);
        }
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(report(&SampleSet::new()), "");
        assert!(parse_report("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_report("1024,4.00\n2048\n"),
            Err(ReportParseError::Row { .. }) | Err(ReportParseError::Csv(_))
        ));
        assert!(matches!(
            parse_report("1k,4.00\n"),
            Err(ReportParseError::Row { line: 1, .. })
        ));
        assert!(matches!(
            parse_report("1024,fast\n"),
            Err(ReportParseError::Row { .. })
        ));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_is_surfaced() {
        let err = CsvFormatter::new()
            .print_report(&mut BrokenPipe, &samples(), &RunSummary::default())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
