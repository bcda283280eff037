use latsweep::config::Config;
use latsweep::{
    ColorMode, CommandProbe, OutputFormat, Sampler, create_formatter, parse_size,
};

use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "latsweep")]
#[command(about = "Measure load latency across working-set sizes with latency2001")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// CPU to allocate memory on
    #[arg(short = 'a', long)]
    alloc_cpu: Option<usize>,

    /// CPU to run on
    #[arg(short = 'c', long)]
    run_cpu: Option<usize>,

    /// Use large pages
    #[arg(short = 'l', long)]
    large_pages: bool,

    /// Report latency as time (default processor cycles)
    #[arg(short = 't', long)]
    report_time: bool,

    /// Smallest working-set size (e.g. 1024, 4k)
    #[arg(long, value_parser = parse_size)]
    min_size: Option<u64>,

    /// Largest working-set size (e.g. 256M)
    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Relative latency change that triggers refinement
    #[arg(long)]
    threshold: Option<f64>,

    /// Number of refinement passes
    #[arg(long)]
    passes: Option<usize>,

    /// Path to the latency2001 binary
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Output format (csv, json, clean)
    #[arg(long)]
    format: Option<OutputFormat>,

    /// Color mode (auto, always, never)
    #[arg(long)]
    color: Option<ColorMode>,

    /// Don't wrap the binary in `setarch -R`
    #[arg(long)]
    no_setarch: bool,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli, &mut io::stdout().lock()) {
        tracing::error!("{}", e);
        return Err(e);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    // Progress goes to stderr too, so stay quiet unless asked.
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(cpu) = cli.alloc_cpu {
        config.probe.alloc_cpu = Some(cpu);
    }
    if let Some(cpu) = cli.run_cpu {
        config.probe.run_cpu = Some(cpu);
    }
    if cli.large_pages {
        config.probe.large_pages = true;
    }
    if cli.report_time {
        config.probe.report_time = true;
    }
    if cli.no_setarch {
        config.probe.disable_aslr = false;
    }
    if let Some(ref binary) = cli.binary {
        config.probe.binary = binary.clone();
    }
    if let Some(size) = cli.min_size {
        config.sampling.min_size = size;
    }
    if let Some(size) = cli.max_size {
        config.sampling.max_size = size;
    }
    if let Some(threshold) = cli.threshold {
        config.sampling.threshold = threshold;
    }
    if let Some(passes) = cli.passes {
        config.sampling.passes = passes;
    }
    if let Some(format) = cli.format {
        config.output.format = format;
    }
    if let Some(color) = cli.color {
        config.output.color = color;
    }

    config.validate()?;
    Ok(config)
}

fn run(cli: &Cli, out: &mut dyn Write) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;

    let formatter = create_formatter(
        config.output.format,
        config.output.color,
        config.sampling.threshold,
    );
    formatter.print_config(&config);

    let mut probe = CommandProbe::new(&config.probe)?;
    let mut sampler = Sampler::new(config.sampling.clone());

    // Nothing reaches the report writer unless every measurement succeeded.
    let summary = sampler.run(&mut probe, formatter.as_ref())?;

    formatter.print_report(out, sampler.samples(), &summary)?;
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "latsweep",
            "-a",
            "0",
            "-c",
            "8",
            "-l",
            "-t",
            "--min-size",
            "4k",
            "--max-size",
            "1M",
            "--passes",
            "3",
            "--format",
            "clean",
            "--no-setarch",
        ]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.probe.alloc_cpu, Some(0));
        assert_eq!(config.probe.run_cpu, Some(8));
        assert!(config.probe.large_pages);
        assert!(config.probe.report_time);
        assert!(!config.probe.disable_aslr);
        assert_eq!(config.sampling.min_size, 4096);
        assert_eq!(config.sampling.max_size, 1024 * 1024);
        assert_eq!(config.sampling.passes, 3);
        assert_eq!(config.sampling.threshold, 0.1);
        assert_eq!(config.output.format, OutputFormat::Clean);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let cli = Cli::parse_from(["latsweep", "--min-size", "1M", "--max-size", "4k"]);
        assert!(load_config(&cli).is_err());
    }

    #[cfg(unix)]
    mod fake_binary {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Fake latency2001 reporting latency equal to the size. Fails on the
        /// call numbered `fail_on` (1-based), or never when zero.
        fn write_binary(dir: &Path, fail_on: u32) -> PathBuf {
            let counter = dir.join("calls");
            let path = dir.join("latency2001");
            let body = format!(
                "#!/bin/sh\n\
                 n=$(cat '{counter}' 2>/dev/null || echo 0)\n\
                 n=$((n + 1))\n\
                 echo $n > '{counter}'\n\
                 if [ $n -eq {fail_on} ]; then echo 'mmap failed' >&2; exit 1; fi\n\
                 for last; do :; done\n\
                 echo 'size,cycles,ns'\n\
                 echo \"$last,$last.00,1.00\"\n",
                counter = counter.display(),
            );
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn cli_for(binary: &Path) -> Cli {
            Cli::parse_from([
                "latsweep",
                "--binary",
                binary.to_str().unwrap(),
                "--no-setarch",
                "--min-size",
                "1k",
                "--max-size",
                "4k",
                "--passes",
                "1",
            ])
        }

        #[test]
        fn test_failed_run_writes_no_report() {
            let dir = tempfile::tempdir().unwrap();
            let binary = write_binary(dir.path(), 3);

            let mut out = Vec::new();
            assert!(run(&cli_for(&binary), &mut out).is_err());
            assert!(out.is_empty());
        }

        #[test]
        fn test_successful_run_writes_report() {
            let dir = tempfile::tempdir().unwrap();
            let binary = write_binary(dir.path(), 0);

            let mut out = Vec::new();
            run(&cli_for(&binary), &mut out).unwrap();

            // Sweep 1024, 2048, 4096; one pass adds 3072 (1536 is misaligned).
            let report = String::from_utf8(out).unwrap();
            assert_eq!(
                report,
                "1024,1024.00\n2048,2048.00\n3072,3072.00\n4096,4096.00\n"
            );
        }
    }
}
