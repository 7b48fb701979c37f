use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use store_load::config::{LoadProfile, LoadSettings, QueryCatalog, RunFile};
use store_load::driver::config::{parse_connect_kv, parse_driver};
use store_load::driver::{Driver, DriverBuilder};
use store_load::logging;
use store_load::output::{self, OutputWriter, RunReport};
use store_load::probe::probe_endpoints;
use store_load::roles::controller::LoadController;
use store_load::store::{DEFAULT_STORE_PORT, load_store_list};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "store-load")]
#[command(about = "Sustained query load against many store databases, throttled per endpoint")]
struct Cli {
    /// Run ID for tagging outputs (random if empty)
    #[arg(long, default_value = "")]
    run_id: String,

    /// Output directory for artifacts
    #[arg(long, default_value = "./artifacts")]
    out_dir: PathBuf,

    /// Log level / filter directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to a dated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Snapshot interval in seconds for periodic stats output
    #[arg(long, default_value = "5")]
    snapshot_interval: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every store until the duration elapses or Ctrl+C
    Run {
        /// Store list file (ip:port:database per line)
        #[arg(long, required = true)]
        stores: PathBuf,

        /// YAML run file with settings and queries
        #[arg(long)]
        config: Option<PathBuf>,

        /// Extra query as name=SQL (repeatable)
        #[arg(long = "query")]
        queries: Vec<String>,

        /// Use the high-load profile (more workers per store)
        #[arg(long)]
        high_load: bool,

        /// Database driver (postgres, mock)
        #[arg(long, default_value = "postgres")]
        driver: String,

        /// Driver option as key=value (repeatable)
        #[arg(long = "connect")]
        connect: Vec<String>,

        /// Duration in seconds; runs until Ctrl+C if omitted
        #[arg(long)]
        duration: Option<u64>,

        /// Optional CSV snapshot file (stdout summary if omitted)
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Concurrently loaded stores per endpoint
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Workers per store
        #[arg(long)]
        threads_per_store: Option<usize>,

        /// Rotate a store out after this many seconds
        #[arg(long)]
        max_dwell: Option<u64>,

        /// Probe one store per endpoint before starting
        #[arg(long)]
        preflight: bool,

        /// Port for store-list lines without one
        #[arg(long, default_value_t = DEFAULT_STORE_PORT)]
        default_port: u16,
    },
    /// Check connectivity to one store per endpoint and exit
    Probe {
        #[arg(long, required = true)]
        stores: PathBuf,

        #[arg(long, default_value = "postgres")]
        driver: String,

        #[arg(long = "connect")]
        connect: Vec<String>,

        #[arg(long, default_value = "10")]
        max_endpoints: usize,

        /// Per-endpoint timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        #[arg(long, default_value_t = DEFAULT_STORE_PORT)]
        default_port: u16,
    },
}

fn build_driver(name: &str, connect: &[String]) -> Result<Arc<dyn Driver>> {
    let Some(kind) = parse_driver(name) else {
        bail!("unknown driver {:?}", name);
    };
    DriverBuilder::build(kind, parse_connect_kv(connect)).map_err(|e| anyhow::anyhow!("driver setup failed: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = logging::init(&cli.log_level, cli.log_dir.as_deref())?;
    if let Some(path) = &log_file {
        println!("Logging to: {}", path.display());
    }

    let run_id = if cli.run_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        cli.run_id.clone()
    };
    println!("store-load starting with run_id: {}", run_id);

    match cli.command {
        Commands::Run {
            stores,
            config,
            queries,
            high_load,
            driver,
            connect,
            duration,
            csv,
            max_concurrency,
            threads_per_store,
            max_dwell,
            preflight,
            default_port,
        } => {
            let (mut settings, mut catalog) = match &config {
                Some(path) => {
                    let rf = RunFile::load(path).await?;
                    (rf.settings, rf.queries)
                }
                None => (LoadSettings::default(), QueryCatalog::default()),
            };
            if high_load {
                settings.threads_per_store = LoadSettings::for_profile(LoadProfile::HighLoad).threads_per_store;
            }
            if let Some(v) = max_concurrency {
                settings.max_concurrency_per_endpoint = v;
            }
            if let Some(v) = threads_per_store {
                settings.threads_per_store = v;
            }
            if max_dwell.is_some() {
                settings.max_dwell_secs = max_dwell;
            }
            settings.preflight |= preflight;
            catalog.extend(QueryCatalog::from_pairs(&queries)?);

            let store_list = load_store_list(&stores, default_port)
                .await
                .with_context(|| format!("loading stores from {}", stores.display()))?;
            let driver = build_driver(&driver, &connect)?;

            let controller = LoadController::new(settings, catalog, driver);
            let started_at = Utc::now();
            controller.start(&store_list).await?;
            if !controller.is_running() {
                println!("Nothing to load.");
                return Ok(());
            }

            let mut out = match &csv {
                Some(path) => OutputWriter::new_csv(path).await?,
                None => OutputWriter::new_stdout(),
            };
            let mut ticker = tokio::time::interval(Duration::from_secs(cli.snapshot_interval.max(1)));
            ticker.tick().await;
            let deadline = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        out.write_snapshot(&controller.global_snapshot()).await?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received");
                        break;
                    }
                    _ = &mut deadline => {
                        info!("duration elapsed");
                        break;
                    }
                }
            }

            println!("Stopping...");
            controller.stop().await;
            let snapshot = controller.global_snapshot();
            out.write_snapshot(&snapshot).await?;
            let ranking = controller.per_endpoint_summary();
            output::print_ranking(&ranking);

            let probes = controller.probe_results();
            let report_path = cli.out_dir.join(&run_id).join("report.json");
            output::write_report(
                &report_path,
                &RunReport {
                    run_id: &run_id,
                    started_at,
                    finished_at: Utc::now(),
                    settings: controller.settings(),
                    preflight: &probes,
                    ranking: &ranking,
                    final_snapshot: &snapshot,
                },
            )
            .await?;
            println!("Report written to: {}", report_path.display());
            Ok(())
        }
        Commands::Probe {
            stores,
            driver,
            connect,
            max_endpoints,
            timeout,
            default_port,
        } => {
            let store_list = load_store_list(&stores, default_port)
                .await
                .with_context(|| format!("loading stores from {}", stores.display()))?;
            let driver = build_driver(&driver, &connect)?;
            let results = probe_endpoints(driver, &store_list, max_endpoints, Duration::from_secs(timeout)).await;
            for r in &results {
                println!(
                    "{:<24} {:<20} {:<4} {:>6}ms  {}",
                    r.endpoint.as_str(),
                    r.store,
                    if r.ok { "ok" } else { "FAIL" },
                    r.elapsed_ms,
                    r.message
                );
            }
            let failed = results.iter().filter(|r| !r.ok).count();
            if failed > 0 {
                bail!("{} of {} endpoints unreachable", failed, results.len());
            }
            Ok(())
        }
    }
}
