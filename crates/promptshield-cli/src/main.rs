use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use promptshield_core::{
    apply_fixes, filter_threats, render_report, sanitize, sanitize_strict, scan, CacheManager,
    FilterOptions, OutputFormat, ScanContext, ScanOptions, Severity, WorkspaceState,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "promptshield",
    author,
    version,
    about = "Unicode threat scanner for LLM inputs and source trees"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan files (or stdin) for Unicode and prompt-injection threats
    Scan {
        /// Files to scan; stdin is scanned when omitted
        paths: Vec<PathBuf>,
        /// Emit the report as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
        /// Drop threats below this severity
        #[arg(long, value_enum, default_value_t = SeverityArg::Low)]
        min_severity: SeverityArg,
        /// Stop at the first threat found
        #[arg(long)]
        stop_on_first: bool,
        /// Ignore inline promptshield-ignore directives
        #[arg(long)]
        no_ignore: bool,
    },
    /// Apply the safe subset of fixes to files
    Fix {
        paths: Vec<PathBuf>,
        /// Rewrite the files in place instead of printing to stdout
        #[arg(long)]
        write: bool,
    },
    /// Strip invisible characters and smuggling patterns from stdin
    Sanitize {
        /// Additionally apply full NFKC normalization
        #[arg(long)]
        strict: bool,
    },
    /// Workspace cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Remove the cache directory and its state
    Clear {
        /// Cache directory
        #[arg(long, default_value = ".promptshield")]
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeverityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Low => Severity::Low,
            SeverityArg::Medium => Severity::Medium,
            SeverityArg::High => Severity::High,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Scan {
            paths,
            json,
            min_severity,
            stop_on_first,
            no_ignore,
        } => {
            let options = ScanOptions {
                stop_on_first_threat: stop_on_first,
                min_severity: min_severity.into(),
                ..ScanOptions::default()
            };
            let found = scan_command(&paths, json, &options, no_ignore)?;
            if found {
                std::process::exit(1);
            }
        }
        Commands::Fix { paths, write } => fix_command(&paths, write)?,
        Commands::Sanitize { strict } => {
            let input = read_stdin()?;
            let output = if strict {
                sanitize_strict(&input)
            } else {
                sanitize(&input)
            };
            print!("{output}");
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear { dir } => {
                let state = WorkspaceState::load(&dir).await;
                let cache = CacheManager::new(".", &dir, &state);
                cache.clear().await;
                println!("Cache cleared: {}", dir.display());
            }
        },
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    Ok(input)
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn scan_text(text: &str, options: &ScanOptions, no_ignore: bool) -> promptshield_core::ScanResult {
    let mut ctx = ScanContext::new();
    let mut result = scan(text, options, &mut ctx);
    let filtered = filter_threats(
        text,
        std::mem::take(&mut result.threats),
        &FilterOptions {
            no_inline_ignore: no_ignore,
        },
    );
    for range in &filtered.unused_ignores {
        eprintln!(
            "{} unused ignore directive covering lines {}-{}",
            "warning:".yellow().bold(),
            range.start,
            range.end
        );
    }
    result.threats = filtered.threats;
    result.is_clean = result.threats.is_empty();
    result
}

fn scan_command(
    paths: &[PathBuf],
    json: bool,
    options: &ScanOptions,
    no_ignore: bool,
) -> Result<bool> {
    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let mut any_threats = false;

    if paths.is_empty() {
        let text = read_stdin()?;
        let result = scan_text(&text, options, no_ignore);
        any_threats |= !result.is_clean;
        println!("{}", render_report(&result, format)?);
        return Ok(any_threats);
    }

    for path in paths {
        let text = read_input(path)?;
        let result = scan_text(&text, options, no_ignore);
        any_threats |= !result.is_clean;
        if !json {
            let headline = if result.is_clean {
                format!("{}: clean", path.display()).green().to_string()
            } else {
                format!("{}: {} threat(s)", path.display(), result.threats.len())
                    .red()
                    .bold()
                    .to_string()
            };
            println!("{headline}");
        }
        println!("{}", render_report(&result, format)?);
    }
    Ok(any_threats)
}

fn fix_command(paths: &[PathBuf], write: bool) -> Result<()> {
    for path in paths {
        let text = read_input(path)?;
        let result = scan_text(&text, &ScanOptions::default(), false);
        let fix = apply_fixes(&text, &result.threats);
        eprintln!(
            "{}: fixed {}, skipped {}",
            path.display(),
            fix.fixed.len(),
            fix.skipped.len()
        );
        if write {
            std::fs::write(path, fix.text)
                .with_context(|| format!("failed to write {}", path.display()))?;
        } else {
            print!("{}", fix.text);
        }
    }
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
