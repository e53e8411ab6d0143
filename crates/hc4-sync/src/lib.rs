//! Download pipeline orchestration: work index, per-archive extraction and
//! validation, and the bounded dispatcher that writes validated documents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hc4_archive::{
    ArchiveClientConfig, ArchiveSource, ArticleExtractor, BackoffPolicy, FetchError,
    HtmlArticleExtractor, HttpArchiveSource, RetryDisposition,
};
use hc4_core::{ExtractedDocument, Language, ManifestEntry};
use hc4_storage::{
    read_logged_ids, AppendWriter, CompletionLedger, ManifestRecords, StorageLayout, WriteError,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hc4-sync";

/// Cancellation check interval for backoff waits outside a tokio runtime.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("cannot restart and resume at the same time")]
    RestartAndResume,
    #[error("no languages to process")]
    NoLanguages,
    #[error("no documents need to be captured")]
    NothingToCapture,
    #[error("{0} already exists; pass --resume to continue or --restart to start over")]
    OutputExists(PathBuf),
    #[error("retry budget must allow at least one attempt")]
    ZeroRetryBudget,
    #[error("worker count must be at least 1")]
    ZeroWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Refuse to touch existing output.
    Fresh,
    /// Delete existing output first.
    Restart,
    /// Keep existing output and skip work it already covers.
    Resume,
}

impl RunMode {
    pub fn from_flags(restart: bool, resume: bool) -> Result<Self, ConfigurationError> {
        match (restart, resume) {
            (true, true) => Err(ConfigurationError::RestartAndResume),
            (true, false) => Ok(RunMode::Restart),
            (false, true) => Ok(RunMode::Resume),
            (false, false) => Ok(RunMode::Fresh),
        }
    }
}

/// How a resumed run decides what is already done. The two are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Skip ids already present in each language's log. Partially captured
    /// archives are revisited for their remaining ids.
    #[default]
    Contents,
    /// Skip every archive recorded in the completion ledger, all or nothing.
    Ledger,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub storage_dir: PathBuf,
    /// Manifest files per language, read in the given order.
    pub manifests: BTreeMap<Language, Vec<PathBuf>>,
    pub workers: usize,
    /// Total attempts allowed per archive.
    pub max_retries: usize,
    pub mode: RunMode,
    pub resume_policy: ResumePolicy,
    pub validate_strict: bool,
    pub backoff: BackoffPolicy,
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.manifests.values().all(Vec::is_empty) {
            return Err(ConfigurationError::NoLanguages);
        }
        if self.max_retries == 0 {
            return Err(ConfigurationError::ZeroRetryBudget);
        }
        if self.workers == 0 {
            return Err(ConfigurationError::ZeroWorkers);
        }
        Ok(())
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.manifests
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(lang, _)| *lang)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            validate_strict: self.validate_strict,
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }
}

/// Open the human-readable run log: appended on resume, truncated otherwise.
pub fn open_run_log(layout: &StorageLayout, mode: RunMode) -> io::Result<File> {
    fs::create_dir_all(layout.root())?;
    let mut options = OpenOptions::new();
    options.create(true);
    if mode == RunMode::Resume {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(layout.run_log_path())
}

/// Document id -> language -> expected fingerprint, for one archive.
pub type WantList = HashMap<String, BTreeMap<Language, String>>;

/// Archive -> want-list. Archives appear only while they hold a wanted id.
#[derive(Debug, Clone, Default)]
pub struct WorkIndex {
    archives: BTreeMap<String, WantList>,
}

impl WorkIndex {
    /// A repeated `(id, language)` keeps the fingerprint seen last.
    pub fn insert(&mut self, entry: ManifestEntry) {
        self.archives
            .entry(entry.source_archive)
            .or_default()
            .entry(entry.document_id)
            .or_default()
            .insert(entry.language, entry.expected_fingerprint);
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }

    pub fn document_count(&self) -> usize {
        self.archives.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn want_list(&self, archive: &str) -> Option<&WantList> {
        self.archives.get(archive)
    }

    pub fn into_archives(self) -> impl Iterator<Item = (String, WantList)> {
        self.archives.into_iter()
    }
}

/// Work a resumed run already has.
#[derive(Debug, Clone, Default)]
pub enum Exclusions {
    #[default]
    Nothing,
    CapturedIds(BTreeMap<Language, HashSet<String>>),
    CompletedArchives(HashSet<String>),
}

impl Exclusions {
    pub fn excludes(&self, entry: &ManifestEntry) -> bool {
        match self {
            Exclusions::Nothing => false,
            Exclusions::CapturedIds(ids) => ids
                .get(&entry.language)
                .is_some_and(|set| set.contains(&entry.document_id)),
            Exclusions::CompletedArchives(done) => done.contains(&entry.source_archive),
        }
    }
}

pub fn build_work_index(
    manifests: &BTreeMap<Language, Vec<PathBuf>>,
    exclusions: &Exclusions,
) -> Result<WorkIndex> {
    let mut index = WorkIndex::default();
    for (language, files) in manifests {
        for file in files {
            debug!(%language, file = %file.display(), "reading manifest");
            for record in ManifestRecords::open(file)? {
                let entry = record?.into_entry(*language);
                if !exclusions.excludes(&entry) {
                    index.insert(entry);
                }
            }
        }
    }
    Ok(index)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub validate_strict: bool,
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintMismatch {
    pub document_id: String,
    pub language: Language,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for FingerprintMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) expected {}, got {}",
            self.document_id, self.language, self.expected, self.actual
        )
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fingerprint mismatch: {0}")]
    Mismatch(FingerprintMismatch),
    #[error("found {found} of {wanted} wanted documents")]
    Incomplete { found: usize, wanted: usize },
    #[error("cancelled")]
    Cancelled,
}

/// Validated output of the one attempt that succeeded.
#[derive(Debug, Clone, Default)]
pub struct ArchiveCapture {
    pub archive: String,
    pub attempts: usize,
    pub documents: BTreeMap<Language, Vec<ExtractedDocument>>,
    pub mismatches: Vec<FingerprintMismatch>,
    /// Wanted ids the archive never produced (lenient mode only).
    pub missing: usize,
}

#[derive(Debug)]
pub enum ArchiveOutcome {
    Succeeded(ArchiveCapture),
    Exhausted {
        archive: String,
        attempts: usize,
        last_error: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("cancelled while processing {0}")]
    Cancelled(String),
}

/// Per-attempt accumulator. A failed attempt drops its buffer whole.
struct AttemptBuffer<'a> {
    wants: &'a WantList,
    strict: bool,
    found: HashSet<String>,
    documents: BTreeMap<Language, Vec<ExtractedDocument>>,
    mismatches: Vec<FingerprintMismatch>,
}

impl<'a> AttemptBuffer<'a> {
    fn new(wants: &'a WantList, strict: bool) -> Self {
        Self {
            wants,
            strict,
            found: HashSet::new(),
            documents: BTreeMap::new(),
            mismatches: Vec::new(),
        }
    }

    fn already_found(&self, id: &str) -> bool {
        self.found.contains(id)
    }

    fn accept(&mut self, doc: ExtractedDocument) -> Result<(), AttemptError> {
        let wants = self.wants;
        let Some(languages) = wants.get(&doc.id) else {
            return Ok(());
        };
        let actual = doc.fingerprint();
        for (language, expected) in languages {
            if &actual != expected {
                let mismatch = FingerprintMismatch {
                    document_id: doc.id.clone(),
                    language: *language,
                    expected: expected.clone(),
                    actual: actual.clone(),
                };
                if self.strict {
                    return Err(AttemptError::Mismatch(mismatch));
                }
                warn!(
                    record_id = %doc.id,
                    %language,
                    expected = %mismatch.expected,
                    actual = %mismatch.actual,
                    "fingerprint mismatch, keeping document"
                );
                self.mismatches.push(mismatch);
            }
        }
        for language in languages.keys() {
            self.documents.entry(*language).or_default().push(doc.clone());
        }
        self.found.insert(doc.id);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.found.len() == self.wants.len()
    }

    fn finish(self, archive: &str, attempts: usize) -> Result<ArchiveCapture, AttemptError> {
        let missing = self.wants.len() - self.found.len();
        if missing > 0 {
            if self.strict {
                return Err(AttemptError::Incomplete {
                    found: self.found.len(),
                    wanted: self.wants.len(),
                });
            }
            info!(archive, missing, "archive ended before every wanted document was found");
        }
        Ok(ArchiveCapture {
            archive: archive.to_string(),
            attempts,
            documents: self.documents,
            mismatches: self.mismatches,
            missing,
        })
    }
}

/// Runs the fetch / extract / validate state machine for one archive.
///
/// Blocking: call it from a blocking thread, never from an async task.
pub struct ArchiveWorker<'a> {
    pub source: &'a dyn ArchiveSource,
    pub extractor: &'a dyn ArticleExtractor,
    pub config: &'a WorkerConfig,
    pub cancel: &'a CancellationToken,
}

impl ArchiveWorker<'_> {
    pub fn process(&self, archive: &str, wants: &WantList) -> Result<ArchiveOutcome, WorkerError> {
        let cancelled = || WorkerError::Cancelled(archive.to_string());
        let budget = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=budget {
            if self.cancel.is_cancelled() {
                return Err(cancelled());
            }
            let span = info_span!("archive_attempt", archive, attempt);
            let _guard = span.enter();

            let err = match self.attempt(archive, wants, attempt) {
                Ok(capture) => return Ok(ArchiveOutcome::Succeeded(capture)),
                Err(AttemptError::Cancelled) => return Err(cancelled()),
                Err(err) => err,
            };
            if self.cancel.is_cancelled() {
                return Err(cancelled());
            }
            if let AttemptError::Fetch(fetch) = &err {
                if fetch.disposition() == RetryDisposition::NonRetryable {
                    warn!(archive, error = %err, "archive cannot be fetched, skipping");
                    return Ok(ArchiveOutcome::Exhausted {
                        archive: archive.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            }
            warn!(archive, attempt, budget, error = %err, "attempt failed, discarding its documents");
            last_error = err.to_string();

            if attempt < budget && !self.pause(self.config.backoff.delay_for_attempt(attempt - 1)) {
                return Err(cancelled());
            }
        }

        warn!(archive, attempts = budget, "retry budget exhausted, archive skipped for this run");
        Ok(ArchiveOutcome::Exhausted {
            archive: archive.to_string(),
            attempts: budget,
            last_error,
        })
    }

    fn attempt(
        &self,
        archive: &str,
        wants: &WantList,
        attempt: usize,
    ) -> Result<ArchiveCapture, AttemptError> {
        let mut buffer = AttemptBuffer::new(wants, self.config.validate_strict);
        if buffer.is_complete() {
            return buffer.finish(archive, attempt);
        }

        let records = self.source.open(archive)?;
        for record in records {
            if self.cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let record = record?;
            if !wants.contains_key(&record.record_id) || buffer.already_found(&record.record_id) {
                continue;
            }

            let article = match self.extractor.extract(&record) {
                Ok(article) => article,
                Err(err) => {
                    warn!(archive, record_id = %record.record_id, error = %err, "extraction failed");
                    continue;
                }
            };
            buffer.accept(ExtractedDocument {
                id: record.record_id,
                source_archive: archive.to_string(),
                time: article.time,
                title: article.title,
                text: article.text,
                url: record.target_uri.unwrap_or_default(),
            })?;

            if buffer.is_complete() {
                info!(archive, "found all needed documents, stopping early");
                break;
            }
        }

        buffer.finish(archive, attempt)
    }

    /// Sleep between attempts; `false` if cancelled meanwhile.
    fn pause(&self, delay: Duration) -> bool {
        if let Ok(handle) = Handle::try_current() {
            return handle.block_on(async {
                tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            });
        }
        let deadline = Instant::now() + delay;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Completed,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub archive: String,
    pub status: ArchiveStatus,
    pub attempts: usize,
    pub written: BTreeMap<Language, usize>,
    pub mismatches: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run cancelled")]
    Cancelled,
    #[error("writing documents from {archive}: {source}")]
    Write {
        archive: String,
        #[source]
        source: WriteError,
    },
    #[error("recording completion of {archive}: {source}")]
    Ledger {
        archive: String,
        #[source]
        source: io::Error,
    },
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
struct ArchiveTask {
    source: Arc<dyn ArchiveSource>,
    extractor: Arc<dyn ArticleExtractor>,
    writer: AppendWriter,
    ledger: CompletionLedger,
    config: WorkerConfig,
}

impl ArchiveTask {
    fn run(
        &self,
        archive: &str,
        wants: &WantList,
        cancel: &CancellationToken,
    ) -> Result<ArchiveReport, DispatchError> {
        let worker = ArchiveWorker {
            source: self.source.as_ref(),
            extractor: self.extractor.as_ref(),
            config: &self.config,
            cancel,
        };
        let outcome = worker
            .process(archive, wants)
            .map_err(|_| DispatchError::Cancelled)?;

        match outcome {
            ArchiveOutcome::Succeeded(capture) => {
                let mut written = BTreeMap::new();
                for (language, docs) in &capture.documents {
                    let count = self.writer.append(*language, docs).map_err(|source| {
                        DispatchError::Write {
                            archive: archive.to_string(),
                            source,
                        }
                    })?;
                    written.insert(*language, count);
                }
                self.ledger
                    .record_done(archive)
                    .map_err(|source| DispatchError::Ledger {
                        archive: archive.to_string(),
                        source,
                    })?;
                info!(archive, attempts = capture.attempts, "archive completed");
                Ok(ArchiveReport {
                    archive: archive.to_string(),
                    status: ArchiveStatus::Completed,
                    attempts: capture.attempts,
                    written,
                    mismatches: capture.mismatches.len(),
                })
            }
            ArchiveOutcome::Exhausted {
                archive,
                attempts,
                last_error,
            } => {
                warn!(%archive, attempts, %last_error, "archive exhausted");
                Ok(ArchiveReport {
                    archive,
                    status: ArchiveStatus::Exhausted,
                    attempts,
                    written: BTreeMap::new(),
                    mismatches: 0,
                })
            }
        }
    }
}

/// Runs one worker per archive on a bounded pool of blocking threads.
pub struct Dispatcher {
    task: ArchiveTask,
    workers: usize,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn ArticleExtractor>,
        writer: AppendWriter,
        ledger: CompletionLedger,
        config: WorkerConfig,
        workers: usize,
    ) -> Self {
        Self {
            task: ArchiveTask {
                source,
                extractor,
                writer,
                ledger,
                config,
            },
            workers: workers.max(1),
        }
    }

    /// Reports come back in scheduling order; completion order is not tracked.
    pub async fn run(
        &self,
        index: WorkIndex,
        cancel: CancellationToken,
    ) -> Result<Vec<ArchiveReport>, DispatchError> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let local = cancel.child_token();
        let mut handles = Vec::with_capacity(index.archive_count());

        for (archive, wants) in index.into_archives() {
            let permit = tokio::select! {
                biased;
                _ = local.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = self.task.clone();
            let token = local.clone();
            let span = Span::current();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _guard = span.enter();
                let result = task.run(&archive, &wants, &token);
                if matches!(
                    result,
                    Err(DispatchError::Write { .. }) | Err(DispatchError::Ledger { .. })
                ) {
                    token.cancel();
                }
                result
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut failure: Option<DispatchError> = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    local.cancel();
                    Err(DispatchError::from(err))
                }
            };
            match result {
                Ok(report) => reports.push(report),
                Err(DispatchError::Cancelled) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(reports)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub archives_total: usize,
    pub archives_completed: usize,
    pub archives_exhausted: usize,
    pub documents_wanted: usize,
    pub documents_written: BTreeMap<Language, usize>,
    pub fingerprint_mismatches: usize,
}

pub struct DownloadPipeline {
    config: DownloadConfig,
    layout: StorageLayout,
    source: Arc<dyn ArchiveSource>,
    extractor: Arc<dyn ArticleExtractor>,
}

impl DownloadPipeline {
    /// Pipeline over the live archive host configured from the environment.
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let source = HttpArchiveSource::new(ArchiveClientConfig::from_env())?;
        Ok(Self::with_components(
            config,
            Arc::new(source),
            Arc::new(HtmlArticleExtractor),
        ))
    }

    pub fn with_components(
        config: DownloadConfig,
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn ArticleExtractor>,
    ) -> Self {
        let layout = StorageLayout::new(config.storage_dir.clone());
        Self {
            config,
            layout,
            source,
            extractor,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Create per-language directories and apply the run mode to existing output.
    fn prepare_storage(&self) -> Result<BTreeMap<Language, PathBuf>> {
        let mut paths = BTreeMap::new();
        for language in self.config.languages() {
            let path = self.layout.language_log(language);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            if path.exists() {
                match self.config.mode {
                    RunMode::Restart => {
                        warn!(path = %path.display(), "log exists, deleting for restart");
                        fs::remove_file(&path)
                            .with_context(|| format!("removing {}", path.display()))?;
                    }
                    RunMode::Fresh => {
                        return Err(ConfigurationError::OutputExists(path).into());
                    }
                    RunMode::Resume => {}
                }
            }
            paths.insert(language, path);
        }

        let ledger = self.layout.ledger_path();
        if self.config.mode != RunMode::Resume && ledger.exists() {
            warn!(path = %ledger.display(), "discarding completion ledger from an earlier run");
            fs::remove_file(&ledger).with_context(|| format!("removing {}", ledger.display()))?;
        }
        Ok(paths)
    }

    fn exclusions(&self, paths: &BTreeMap<Language, PathBuf>) -> Result<Exclusions> {
        if self.config.mode != RunMode::Resume {
            return Ok(Exclusions::Nothing);
        }
        match self.config.resume_policy {
            ResumePolicy::Contents => {
                let mut captured = BTreeMap::new();
                for (language, path) in paths {
                    let ids = read_logged_ids(path)?;
                    info!(%language, documents = ids.len(), "resuming, documents already downloaded");
                    captured.insert(*language, ids);
                }
                Ok(Exclusions::CapturedIds(captured))
            }
            ResumePolicy::Ledger => {
                let ledger = self.layout.ledger_path();
                let done = CompletionLedger::new(&ledger)
                    .completed_archives()
                    .with_context(|| format!("reading {}", ledger.display()))?;
                info!(archives = done.len(), "resuming, archives already completed");
                Ok(Exclusions::CompletedArchives(done))
            }
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<DownloadSummary> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, cancel)
            .instrument(info_span!("download", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid, cancel: CancellationToken) -> Result<DownloadSummary> {
        let started_at = Utc::now();
        fs::create_dir_all(self.layout.root())
            .with_context(|| format!("creating {}", self.layout.root().display()))?;
        let paths = self.prepare_storage()?;
        let exclusions = self.exclusions(&paths)?;

        info!("building the index of documents to capture");
        let index = build_work_index(&self.config.manifests, &exclusions)?;
        if index.is_empty() {
            return Err(ConfigurationError::NothingToCapture.into());
        }
        let archives_total = index.archive_count();
        let documents_wanted = index.document_count();
        info!(
            documents = documents_wanted,
            archives = archives_total,
            "looking for documents"
        );

        let dispatcher = Dispatcher::new(
            self.source.clone(),
            self.extractor.clone(),
            AppendWriter::new(paths),
            CompletionLedger::new(self.layout.ledger_path()),
            self.config.worker_config(),
            self.config.workers,
        );
        let reports = dispatcher.run(index, cancel).await?;

        let mut documents_written: BTreeMap<Language, usize> = BTreeMap::new();
        let mut archives_completed = 0;
        let mut fingerprint_mismatches = 0;
        for report in &reports {
            if report.status == ArchiveStatus::Completed {
                archives_completed += 1;
            }
            fingerprint_mismatches += report.mismatches;
            for (language, count) in &report.written {
                *documents_written.entry(*language).or_default() += count;
            }
        }

        Ok(DownloadSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            archives_total,
            archives_completed,
            archives_exhausted: reports.len() - archives_completed,
            documents_wanted,
            documents_written,
            fingerprint_mismatches,
        })
    }
}
