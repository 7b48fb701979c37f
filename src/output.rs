use crate::config::LoadSettings;
use crate::metrics::snapshot::{EndpointStats, EndpointSummary, GlobalSnapshot, GlobalTotals};
use crate::probe::ProbeResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

pub const CSV_HEADER: &str = "timestamp,endpoint,active_stores,queued_stores,processed_stores,executed,errors,executed_total,errors_total,active_workers,connected_workers,utilization_pct,latency_us_p50,latency_us_p95,latency_us_p99,latency_us_max";

/// One CSV line per endpoint; the timestamp is shared by the snapshot.
pub fn csv_row(taken_at: &DateTime<Utc>, ep: &EndpointStats) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{:.1},{},{},{},{}",
        taken_at.to_rfc3339(),
        ep.endpoint,
        ep.active_stores,
        ep.queue.pending,
        ep.queue.processed,
        ep.executed,
        ep.errors,
        ep.executed_total,
        ep.errors_total,
        ep.active_workers,
        ep.connected_workers,
        ep.utilization_pct(),
        ep.latency.p50_us,
        ep.latency.p95_us,
        ep.latency.p99_us,
        ep.latency.max_us,
    )
}

pub enum OutputWriter {
    Csv(BufWriter<File>),
    Stdout,
}

impl OutputWriter {
    pub async fn new_csv(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.ok();
            }
        }
        let file = File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(CSV_HEADER.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        println!("Writing CSV snapshots to: {}", path.display());
        Ok(Self::Csv(writer))
    }

    pub fn new_stdout() -> Self {
        Self::Stdout
    }

    pub async fn write_snapshot(&mut self, snapshot: &GlobalSnapshot) -> Result<()> {
        match self {
            Self::Csv(writer) => {
                for ep in &snapshot.endpoints {
                    writer.write_all(csv_row(&snapshot.taken_at, ep).as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                // Flush so external tail/readers see progress promptly
                writer.flush().await?;
            }
            Self::Stdout => println!("{}", status_line(&snapshot.totals)),
        }
        Ok(())
    }
}

/// Compact progress line for the console.
pub fn status_line(t: &GlobalTotals) -> String {
    format!(
        "stores {}/{} queued | endpoints {}/{} active | workers {}/{} connected | executed {} errors {} | p99 {:.2}ms",
        t.active_stores,
        t.queued_stores,
        t.active_endpoints,
        t.endpoints,
        t.connected_workers,
        t.total_workers,
        t.executed_total,
        t.errors_total,
        t.latency.p99_us as f64 / 1_000.0,
    )
}

/// Everything written to `<out-dir>/<run-id>/report.json` at the end of a run.
#[derive(Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub settings: &'a LoadSettings,
    pub preflight: &'a [ProbeResult],
    pub ranking: &'a [EndpointSummary],
    pub final_snapshot: &'a GlobalSnapshot,
}

pub async fn write_report(path: &Path, report: &RunReport<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(report)?;
    fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Ranking table printed when a run ends.
pub fn print_ranking(rows: &[EndpointSummary]) {
    println!(
        "{:<4} {:<24} {:>8} {:>8} {:>12} {:>8} {:>8}",
        "#", "endpoint", "active", "queued", "executed", "errors", "use%"
    );
    for (i, r) in rows.iter().enumerate() {
        println!(
            "{:<4} {:<24} {:>8} {:>8} {:>12} {:>8} {:>7.1}%",
            i + 1,
            r.endpoint.as_str(),
            format!("{}/{}", r.active_stores, r.max_concurrency),
            r.queued_stores,
            r.executed_total,
            r.errors_total,
            r.utilization_pct,
        );
    }
}
