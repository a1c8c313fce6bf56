//! CLI command handling
//!
//! Runs one clamd operation per invocation and formats the outcome.

use std::path::{Path, PathBuf};

use colored::Colorize;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::clamd::{Clamd, ScanReport, ScanResult, ScanResults, ScanStatus, Stats};
use crate::commands::Commands;
use crate::common::Result;

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Overall outcome, mapped to the process exit status by `main`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Infected,
}

/// Dispatch a CLI command
pub async fn dispatch(clamd: &Clamd, command: Commands, format: OutputFormat) -> Result<Verdict> {
    match command {
        Commands::Ping => {
            clamd.ping().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "status": "ok" })),
                OutputFormat::Human => println!("{}", "PONG".green()),
            }
            Ok(Verdict::Clean)
        }

        Commands::Version => {
            let version = clamd.version().await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "av_version": version.raw }))
                }
                OutputFormat::Human => println!("{}", version.raw),
            }
            Ok(Verdict::Clean)
        }

        Commands::Stats => {
            let stats = clamd.stats().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Human => print_stats(&stats),
            }
            Ok(Verdict::Clean)
        }

        Commands::Reload => {
            clamd.reload().await?;
            if format == OutputFormat::Human {
                println!("Virus databases reloading");
            }
            Ok(Verdict::Clean)
        }

        Commands::Shutdown => {
            clamd.shutdown().await?;
            if format == OutputFormat::Human {
                println!("Shutdown requested");
            }
            Ok(Verdict::Clean)
        }

        Commands::Scan { path, mode } => {
            let path = absolute_scan_path(path);
            let results = clamd.scan_path(mode, &path).await?;
            let report = report_results(results, format).await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(verdict(&report))
        }

        Commands::Instream { file, name } => {
            let file = file.filter(|f| f.as_os_str() != "-");
            let label = name.unwrap_or_else(|| upload_label(file.as_deref()));

            let cancel = CancellationToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, cancelling upload");
                    watcher.cancel();
                }
            });

            let source: Box<dyn AsyncRead + Unpin + Send> = match &file {
                Some(path) => Box::new(tokio::fs::File::open(path).await.map_err(|e| {
                    crate::common::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?),
                None => Box::new(tokio::io::stdin()),
            };

            let results = clamd.scan_stream(source, &cancel).await?;
            let report = report_results(results, format).await?;
            if format == OutputFormat::Json {
                let json = serde_json::json!({
                    "file": label,
                    "detected": report.detected,
                    "malware": report.malware.first(),
                    "records": report.records,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else if !report.detected {
                println!("{}: {}", label, "clean".green());
            }
            Ok(verdict(&report))
        }
    }
}

fn verdict(report: &ScanReport) -> Verdict {
    if report.detected {
        Verdict::Infected
    } else {
        Verdict::Clean
    }
}

/// Name reported for an upload: the file stem, like an uploaded form field
fn upload_label(file: Option<&Path>) -> String {
    file.and_then(|f| f.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_string())
}

/// Drain a reply, printing records as they arrive in human mode
async fn report_results(mut results: ScanResults, format: OutputFormat) -> Result<ScanReport> {
    let mut records = Vec::new();
    while let Some(record) = results.next().await {
        let record = record?;
        if format == OutputFormat::Human {
            print_record(&record);
        }
        records.push(record);
    }
    Ok(ScanReport::from_records(records))
}

fn print_record(record: &ScanResult) {
    let status = match record.status {
        ScanStatus::Ok => record.status.as_str().green(),
        ScanStatus::Found => record.status.as_str().red().bold(),
        ScanStatus::Error => record.status.as_str().yellow(),
        ScanStatus::ParseError => record.status.as_str().dimmed(),
    };

    match record.status {
        ScanStatus::ParseError => println!("{} {}", status, record.raw),
        _ if record.description.is_empty() => println!("{}: {}", record.path, status),
        _ => println!("{}: {} {}", record.path, record.description, status),
    }
}

fn print_stats(stats: &Stats) {
    println!("{} {}", "Pools:".bold(), stats.pools);
    for line in [&stats.state, &stats.threads, &stats.queue, &stats.memstats] {
        if !line.is_empty() {
            println!("{}", line);
        }
    }
}

/// Resolve a relative scan path against the current directory
///
/// clamd requires absolute paths and resolves them on its own host.
pub fn absolute_scan_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}
