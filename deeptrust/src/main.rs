// deeptrust/src/main.rs
//
// DeepTrust - ensemble deepfake detection: concurrent detector dispatch,
// weighted score fusion, explainable verdicts.
//
// Three operational modes:
//   analyze - analyze one image file and print the API response
//   tail    - follow a JSONL job queue, one analysis per job (staging / batch)
//   eval    - run a labeled dataset and print precision / recall / F1
//
// Usage:
//   deeptrust --mode analyze --path face.png
//   deeptrust --mode analyze --path face.png --detector frequency
//   deeptrust --mode tail --path /var/spool/deeptrust/jobs.jsonl --output /tmp/deeptrust_output
//   deeptrust --mode eval --path dataset.jsonl --config deeptrust.json

mod analysis;
mod config;
mod detectors;
mod engine;
mod error;
mod eval;
mod media;
mod metrics;
mod pipeline;
mod report;
mod sink;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use analysis::{AnalysisResult, DetectorName, Verdict};
use config::PipelineConfig;
use metrics::MetricsServer;
use pipeline::{HealthStatus, Pipeline};
use report::ApiResponse;
use sink::ReportSink;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "deeptrust",
    about   = "Ensemble deepfake detection: concurrent detector dispatch + weighted fusion",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "analyze")]
    mode: Mode,

    #[arg(long, help = "Image file (analyze), job queue JSONL (tail) or labeled dataset JSONL (eval)")]
    path: PathBuf,

    #[arg(long, help = "JSON pipeline config; weights are hot-reloaded from it")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/deeptrust_output", help = "Report output directory")]
    output: PathBuf,

    #[arg(long, help = "Per-detector timeout in ms (overrides config)")]
    timeout_ms: Option<u64>,

    #[arg(long, help = "Whole-request deadline in ms (overrides config)")]
    deadline_ms: Option<u64>,

    #[arg(long, help = "Deepfake threshold in [0,1] (overrides config)")]
    threshold: Option<f64>,

    #[arg(long, help = "Serve Prometheus /metrics on this port")]
    metrics_port: Option<u16>,

    #[arg(long, help = "Run a single detector (analyze mode): mesonet | xception | frequency | biological")]
    detector: Option<DetectorName>,

    #[arg(long, default_value = "5", help = "Config reload poll interval in seconds (0 = off)")]
    reload_secs: u64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Analyze, // one file, print response
    Tail,    // follow a JSONL job queue
    Eval,    // labeled dataset benchmark
}

/// One line of the tail-mode job queue.
#[derive(Debug, Deserialize)]
struct Job {
    job_id: String,
    path:   PathBuf,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None       => PipelineConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms  { cfg.adapter_timeout_ms  = ms; }
    if let Some(ms) = cli.deadline_ms { cfg.request_deadline_ms = ms; }
    if let Some(t)  = cli.threshold   { cfg.deepfake_threshold  = t; }
    cfg.validate()?;
    Ok(cfg)
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  ____                 _____               _   ");
    println!(" |  _ \\  ___  ___ _ __|_   _| __ _   _ ___| |_ ");
    println!(" | | | |/ _ \\/ _ \\ '_ \\ | || '__| | | / __| __|");
    println!(" | |_| |  __/  __/ |_) || || |  | |_| \\__ \\ |_ ");
    println!(" |____/ \\___|\\___| .__/ |_||_|   \\__,_|___/\\__|");
    println!("                 |_|                            ");
    println!("\x1b[0m");
    println!("  \x1b[90mEnsemble deepfake detection | MesoNet + Xception + Frequency + Biological\x1b[0m\n");
}

fn print_verdict(result: &AnalysisResult) {
    let (color, icon) = match result.verdict {
        Verdict::Deepfake      => ("\x1b[91;1m", "🔴"),
        Verdict::Authentic     => ("\x1b[92;1m", "🟢"),
        Verdict::Indeterminate => ("\x1b[93;1m", "🟡"),
    };
    let reset = "\x1b[0m";
    let conf  = result.confidence.map(|c| format!("{:.4}", c)).unwrap_or_else(|| "-".into());
    let src   = result.media.source.as_deref().unwrap_or("<memory>");

    println!("\n{}{} {}{}", color, icon, result.verdict, reset);
    println!("  Media     : {} ({}x{}, fp={})", src, result.media.width, result.media.height, result.media.fingerprint);
    println!("  Confidence: {}{}{}", color, conf, reset);
    println!("  Degraded  : {}", result.degraded);
    for m in &result.per_model {
        let score = m.score.map(|s| format!("{:.4}", s)).unwrap_or_else(|| "-".into());
        println!("  {:10}: {:>6}  {} ({} ms)", m.name.to_string(), score, m.status, m.elapsed_ms);
    }
    if let Some(reason) = result.indeterminate_reason {
        println!("  Reason    : {} - {}", reason.code(), reason.message());
    }
    println!("  Time      : {} ms", result.processing_time_ms);
}

async fn print_stats_loop(pipeline: Arc<Pipeline>, start: Instant) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let m       = pipeline.metrics();
        let elapsed = start.elapsed().as_secs_f64();
        let load    = |a: &std::sync::atomic::AtomicU64| a.load(std::sync::atomic::Ordering::Relaxed);
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  requests={}  deepfake={}  authentic={}  indeterminate={}  degraded={} ──\x1b[0m",
            elapsed, load(&m.requests), load(&m.deepfake), load(&m.authentic),
            load(&m.indeterminate), load(&m.degraded)
        );
    }
}

// ── Job source ────────────────────────────────────────────────────────────────

async fn tail_jobs(path: PathBuf, tx: mpsc::Sender<Job>, shutdown: CancellationToken) -> Result<()> {
    let file      = tokio::fs::File::open(&path).await
        .with_context(|| format!("opening job queue {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    info!("Tailing {}", path.display());
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            l = lines.next_line() => l?,
        };
        match next {
            Some(line) => {
                let line = line.trim().to_string();
                if line.is_empty() { continue; }
                match serde_json::from_str::<Job>(&line) {
                    Ok(job) => { if tx.send(job).await.is_err() { break; } }
                    Err(e)  => warn!("Job parse error: {}", e),
                }
            }
            None => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn run_job(pipeline: Arc<Pipeline>, sink: Arc<ReportSink>, job: Job, shutdown: CancellationToken) {
    let path  = job.path.clone();
    let loaded = match tokio::task::spawn_blocking(move || media::load_image(&path)).await {
        Ok(m)  => m,
        Err(e) => {
            error!("JOB_LOADER_PANIC job={} error={}", job.job_id, e);
            return;
        }
    };
    let outcome = match loaded {
        Ok(item) => pipeline.analyze_with_cancel(&item, &shutdown.child_token()).await,
        Err(e)   => Err(e),
    };
    let written = match outcome {
        Ok(result) => sink.record_result(&job.job_id, &result).await.map(|_| print_verdict(&result)),
        Err(e)     => sink.record_failure(&job.job_id, &job.path, &e).await,
    };
    if let Err(e) = written {
        error!("Sink write failed job={}: {}", job.job_id, e);
    }
}

// ── Modes ─────────────────────────────────────────────────────────────────────

async fn analyze_one(pipeline: &Pipeline, cli: &Cli, shutdown: &CancellationToken) -> Result<()> {
    let item = media::load_image(&cli.path)?;

    if let Some(name) = cli.detector {
        let r = pipeline.invoke_single(name, &item).await?;
        println!("{}", serde_json::to_string_pretty(&r)?);
        return Ok(());
    }

    let result   = pipeline.analyze_with_cancel(&item, shutdown).await?;
    let response = ApiResponse::from(&result);
    print_verdict(&result);
    println!("\n{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn tail(pipeline: Arc<Pipeline>, cli: &Cli, shutdown: CancellationToken) -> Result<()> {
    let sink = Arc::new(ReportSink::new(&cli.output)?);
    let (tx, mut rx) = mpsc::channel::<Job>(1024);

    println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
    println!("  Output: \x1b[90m{}\x1b[0m\n", sink.dir().display());

    let path = cli.path.clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tail_jobs(path, tx, stop).await {
            error!("Job source stopped: {}", e);
        }
    });

    // One task per job; each analysis already fans out per detector.
    let mut jobs = tokio::task::JoinSet::new();
    while let Some(job) = rx.recv().await {
        let p    = Arc::clone(&pipeline);
        let s    = Arc::clone(&sink);
        let stop = shutdown.clone();
        jobs.spawn(run_job(p, s, job, stop));
    }
    while jobs.join_next().await.is_some() {}
    Ok(())
}

async fn evaluate(pipeline: &Pipeline, cli: &Cli) -> Result<()> {
    let result = eval::Evaluator::new(pipeline).run_dataset(&cli.path).await?;
    eval::report::print_markdown(&result);

    std::fs::create_dir_all(&cli.output)?;
    let out = cli.output.join("eval_report.json");
    std::fs::write(&out, eval::report::to_json(&result))?;
    info!("Eval report written to {}", out.display());
    Ok(())
}

fn spawn_background(pipeline: &Arc<Pipeline>, cli: &Cli, config_path: Option<&Path>) {
    if let Some(port) = cli.metrics_port {
        let server = Arc::new(MetricsServer::new(
            Arc::clone(pipeline.metrics()),
            SocketAddr::from(([0, 0, 0, 0], port)),
        ));
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    if let (Some(path), true) = (config_path, cli.reload_secs > 0) {
        let store = Arc::clone(pipeline.weights());
        tokio::spawn(store.watch(path.to_path_buf(), Duration::from_secs(cli.reload_secs)));
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("deeptrust=info".parse()?))
        .compact().init();

    let cli      = Cli::parse();
    let config   = load_config(&cli)?;
    let pipeline = Arc::new(Pipeline::with_default_detectors(config));
    let start    = Instant::now();
    let shutdown = CancellationToken::new();

    print_banner();

    let health = pipeline.health();
    match health.status {
        HealthStatus::Healthy   => info!("Pipeline healthy: {} detectors", health.detectors.len()),
        HealthStatus::Degraded  => warn!("Pipeline degraded: {}", serde_json::to_string(&health.detectors)?),
        HealthStatus::Unhealthy => anyhow::bail!("no enabled detector is ready"),
    }

    spawn_background(&pipeline, &cli, cli.config.as_deref());

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, cancelling in-flight analyses");
            ctrl_c.cancel();
        }
    });

    match cli.mode {
        Mode::Analyze => analyze_one(&pipeline, &cli, &shutdown).await?,
        Mode::Tail => {
            tokio::spawn(print_stats_loop(Arc::clone(&pipeline), start));
            println!("  Press Ctrl+C to stop.\n");
            tail(Arc::clone(&pipeline), &cli, shutdown.clone()).await?;
        }
        Mode::Eval => evaluate(&pipeline, &cli).await?,
    }

    Ok(())
}
