use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hc4_archive::BackoffPolicy;
use hc4_core::Language;
use hc4_storage::{
    audit_collection, reorder_log, sort_manifests_by_shard, MissingKind, ReorderRequest,
    StorageLayout,
};
use hc4_sync::{open_run_log, DownloadConfig, DownloadPipeline, ResumePolicy, RunMode};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 128 + SIGINT.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "hc4")]
#[command(about = "Download and maintain the HC4 Common Crawl document collection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the documents listed in the id manifests.
    Download(DownloadArgs),
    /// Rewrite a language log in manifest order.
    Reorder(ReorderArgs),
    /// List manifest documents missing from a language log.
    Audit(AuditArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResumeFrom {
    /// Skip documents already present in the language logs.
    Contents,
    /// Skip archives recorded as completed in the run ledger.
    Ledger,
}

impl From<ResumeFrom> for ResumePolicy {
    fn from(value: ResumeFrom) -> Self {
        match value {
            ResumeFrom::Contents => ResumePolicy::Contents,
            ResumeFrom::Ledger => ResumePolicy::Ledger,
        }
    }
}

#[derive(Debug, clap::Args)]
struct DownloadArgs {
    /// Output directory; one sub-directory per language.
    #[arg(long)]
    storage: PathBuf,
    /// Chinese id manifests.
    #[arg(long, num_args = 1..)]
    zho: Vec<PathBuf>,
    /// Russian id manifests.
    #[arg(long, num_args = 1..)]
    rus: Vec<PathBuf>,
    /// Persian id manifests.
    #[arg(long, num_args = 1..)]
    fas: Vec<PathBuf>,
    /// Archives processed in parallel.
    #[arg(long, default_value_t = 4)]
    jobs: usize,
    /// Attempts per archive.
    #[arg(long, default_value_t = 20)]
    retry: usize,
    /// Delete existing output and start over.
    #[arg(long)]
    restart: bool,
    /// Continue a previous run.
    #[arg(long)]
    resume: bool,
    #[arg(long, value_enum, default_value_t = ResumeFrom::Contents)]
    resume_policy: ResumeFrom,
    /// Reject archives whose documents fail the fingerprint check.
    #[arg(long)]
    check_hash: bool,
}

impl DownloadArgs {
    fn into_config(self) -> Result<DownloadConfig> {
        let mode = RunMode::from_flags(self.restart, self.resume)?;
        let manifests: BTreeMap<Language, Vec<PathBuf>> = [
            (Language::Chinese, self.zho),
            (Language::Russian, self.rus),
            (Language::Persian, self.fas),
        ]
        .into_iter()
        .filter(|(_, files)| !files.is_empty())
        .collect();

        let config = DownloadConfig {
            storage_dir: self.storage,
            manifests,
            workers: self.jobs,
            max_retries: self.retry,
            mode,
            resume_policy: self.resume_policy.into(),
            validate_strict: self.check_hash,
            backoff: BackoffPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, clap::Args)]
struct ReorderArgs {
    /// Language log to rewrite.
    #[arg(long)]
    log_file: PathBuf,
    /// Id manifests giving the canonical order.
    #[arg(long = "id-file", num_args = 1.., required = true)]
    id_files: Vec<PathBuf>,
    /// Report documents whose content no longer matches the manifest.
    #[arg(long)]
    check_hash: bool,
}

#[derive(Debug, clap::Args)]
struct AuditArgs {
    #[arg(long)]
    log_file: PathBuf,
    #[arg(long = "id-file", num_args = 1.., required = true)]
    id_files: Vec<PathBuf>,
    /// Relevance judgments used to classify missing documents.
    #[arg(long, num_args = 1..)]
    qrels: Vec<PathBuf>,
}

fn init_tracing(run_log: Option<File>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn"));
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file = run_log.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupts {
    /// One interrupt: workers were told to stop.
    Cancelled,
    /// A second interrupt arrived before the run wound down.
    Forced,
    /// Signals could not be received.
    Unavailable,
}

async fn watch_interrupts<F, Fut>(mut next_signal: F, token: CancellationToken) -> Interrupts
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if next_signal().await.is_err() {
        return Interrupts::Unavailable;
    }
    warn!("interrupt received, stopping workers; interrupt again to exit immediately");
    token.cancel();
    if next_signal().await.is_err() {
        return Interrupts::Cancelled;
    }
    Interrupts::Forced
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let watched = token.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, watched).await == Interrupts::Forced {
            warn!("second interrupt, exiting without waiting for workers");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
    token
}

async fn download(args: DownloadArgs) -> Result<()> {
    let config = args.into_config()?;
    let layout = StorageLayout::new(config.storage_dir.clone());
    let run_log = open_run_log(&layout, config.mode)
        .with_context(|| format!("opening {}", layout.run_log_path().display()))?;
    init_tracing(Some(run_log));

    let pipeline = DownloadPipeline::new(config)?;
    let summary = pipeline.run(cancel_on_ctrl_c()).await?;

    let written: Vec<String> = summary
        .documents_written
        .iter()
        .map(|(lang, count)| format!("{lang}={count}"))
        .collect();
    println!(
        "download complete: run_id={} archives={} completed={} exhausted={} wanted={} written=[{}] mismatches={} elapsed={}s",
        summary.run_id,
        summary.archives_total,
        summary.archives_completed,
        summary.archives_exhausted,
        summary.documents_wanted,
        written.join(" "),
        summary.fingerprint_mismatches,
        (summary.finished_at - summary.started_at).num_seconds()
    );
    Ok(())
}

fn reorder(args: ReorderArgs) -> Result<()> {
    init_tracing(None);
    let request = ReorderRequest {
        log_file: args.log_file,
        id_files: sort_manifests_by_shard(args.id_files)?,
        check_hash: args.check_hash,
    };
    let report = reorder_log(&request)
        .with_context(|| format!("reordering {}", request.log_file.display()))?;
    for mismatch in &report.hash_mismatches {
        warn!(
            id = %mismatch.id,
            expected = %mismatch.expected,
            actual = %mismatch.actual,
            "fingerprint mismatch"
        );
    }
    println!(
        "reorder complete: documents={} mismatches={} backup={}",
        report.documents_written,
        report.hash_mismatches.len(),
        report.backup_path.display()
    );
    Ok(())
}

fn audit(args: AuditArgs) -> Result<()> {
    init_tracing(None);
    let report = audit_collection(&args.log_file, &args.id_files, &args.qrels)?;
    for missing in &report.missing {
        println!("missing {} ({:?})", missing.id, missing.kind);
    }
    println!(
        "audit complete: missing={} relevant={} non_relevant={} other={}",
        report.missing_count(),
        report.count(MissingKind::Relevant),
        report.count(MissingKind::NonRelevant),
        report.count(MissingKind::Other)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Download(args) => download(args).await?,
        Commands::Reorder(args) => reorder(args)?,
        Commands::Audit(args) => audit(args)?,
    }

    Ok(())
}
