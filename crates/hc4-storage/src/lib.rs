//! On-disk formats for HC4: id manifests, per-language document logs, the
//! completion ledger, and the at-rest reorder / audit passes over those logs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use flate2::read::MultiGzDecoder;
use hc4_core::{fingerprint, ExtractedDocument, Language, ManifestEntry};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hc4-storage";

pub const DOCS_FILE_NAME: &str = "hc4_docs.jsonl";
pub const LEDGER_FILE_NAME: &str = "hc4_runs.log";
pub const RUN_LOG_FILE_NAME: &str = "hc4_log.txt";
pub const DONE_PREFIX: &str = "done-cc-file:";

/// Paths of everything a download run keeps under its storage directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn language_log(&self, language: Language) -> PathBuf {
        self.root.join(language.code()).join(DOCS_FILE_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE_NAME)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.root.join(RUN_LOG_FILE_NAME)
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Open a text file for line reading, gunzipping `.gz` files on the fly.
pub fn open_text(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Wire format of one manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestRecord {
    pub id: String,
    #[serde(alias = "source_archive")]
    pub cc_file: String,
    #[serde(alias = "fingerprint")]
    pub md5: String,
}

impl ManifestRecord {
    pub fn into_entry(self, language: Language) -> ManifestEntry {
        ManifestEntry {
            document_id: self.id,
            source_archive: self.cc_file,
            expected_fingerprint: self.md5,
            language,
        }
    }
}

/// Streaming reader over one manifest file. Blank lines are skipped.
pub struct ManifestRecords {
    path: PathBuf,
    lines: Lines<Box<dyn BufRead>>,
    line_no: usize,
}

impl ManifestRecords {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let reader = open_text(&path)?;
        Ok(Self {
            path,
            lines: reader.lines(),
            line_no: 0,
        })
    }
}

impl Iterator for ManifestRecords {
    type Item = anyhow::Result<ManifestRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    return Some(
                        Err(err).with_context(|| format!("reading {}", self.path.display())),
                    )
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).with_context(|| {
                format!("parsing {} line {}", self.path.display(), self.line_no)
            }));
        }
    }
}

/// Sort sharded manifests (`name.<n>.jsonl[.gz]`) by their numeric shard.
///
/// A single manifest is returned untouched.
pub fn sort_manifests_by_shard(mut paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, ReorderError> {
    if paths.len() <= 1 {
        return Ok(paths);
    }
    let mut keyed = Vec::with_capacity(paths.len());
    for path in paths.drain(..) {
        let shard = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').nth(1))
            .and_then(|segment| segment.parse::<u64>().ok())
            .ok_or_else(|| ReorderError::UnshardedManifest(path.clone()))?;
        keyed.push((shard, path));
    }
    keyed.sort_by_key(|(shard, _)| *shard);
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

#[derive(Debug, Deserialize)]
struct LoggedId {
    id: String,
}

/// Ids already present in a per-language log. A missing log yields an empty set.
pub fn read_logged_ids(path: &Path) -> anyhow::Result<HashSet<String>> {
    let mut ids = HashSet::new();
    if !path.exists() {
        return Ok(ids);
    }
    let reader = open_text(path)?;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let logged: LoggedId = serde_json::from_str(&line)
            .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))?;
        ids.insert(logged.id);
    }
    Ok(ids)
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("no log configured for language {0}")]
    UnknownLanguage(Language),
    #[error("appending to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing document {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Appends documents to per-language logs behind one process-wide lock, so
/// lines from concurrently finishing archives never interleave.
#[derive(Debug, Clone)]
pub struct AppendWriter {
    lock: Arc<Mutex<()>>,
    paths: BTreeMap<Language, PathBuf>,
}

impl AppendWriter {
    pub fn new(paths: BTreeMap<Language, PathBuf>) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            paths,
        }
    }

    pub fn path_for(&self, language: Language) -> Option<&Path> {
        self.paths.get(&language).map(PathBuf::as_path)
    }

    pub fn append(
        &self,
        language: Language,
        documents: &[ExtractedDocument],
    ) -> Result<usize, WriteError> {
        let path = self
            .paths
            .get(&language)
            .ok_or(WriteError::UnknownLanguage(language))?;
        let io_err = |source| WriteError::Io {
            path: path.clone(),
            source,
        };

        let mut lines = Vec::with_capacity(documents.len());
        for doc in documents {
            let mut line = serde_json::to_vec(doc).map_err(|source| WriteError::Serialize {
                id: doc.id.clone(),
                source,
            })?;
            line.push(b'\n');
            lines.push(line);
        }

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        let mut out = BufWriter::new(file);
        for line in &lines {
            out.write_all(line).map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
        Ok(lines.len())
    }
}

/// Machine-readable record of archives that finished, one
/// `done-cc-file:<archive>` line each.
#[derive(Debug, Clone)]
pub struct CompletionLedger {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl CompletionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_done(&self, archive: &str) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{DONE_PREFIX}{archive}\n").as_bytes())?;
        file.flush()
    }

    pub fn completed_archives(&self) -> io::Result<HashSet<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(err),
        };
        let mut done = HashSet::new();
        for line in BufReader::new(file).lines() {
            if let Some(archive) = line?.trim_end().strip_prefix(DONE_PREFIX) {
                if !archive.is_empty() {
                    done.insert(archive.to_string());
                }
            }
        }
        Ok(done)
    }
}

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("log holds {found} unique documents but the id files list {expected} unique ids")]
    CountMismatch { expected: usize, found: usize },
    #[error("document {0} is listed in the id files but missing from the log")]
    MissingDocument(String),
    #[error("document {id} appears {count} times in the log")]
    DuplicateDocument { id: String, count: usize },
    #[error("manifest {0} has no numeric shard segment in its file name")]
    UnshardedManifest(PathBuf),
    #[error("malformed log line at byte {offset} of {path}: {source}")]
    MalformedLine {
        path: PathBuf,
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Manifest(#[from] anyhow::Error),
}

impl ReorderError {
    /// The log does not hold exactly the documents the id files describe.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ReorderError::CountMismatch { .. }
                | ReorderError::MissingDocument(_)
                | ReorderError::DuplicateDocument { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReorderRequest {
    pub log_file: PathBuf,
    /// Id files in canonical order.
    pub id_files: Vec<PathBuf>,
    pub check_hash: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMismatch {
    pub id: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone)]
pub struct ReorderReport {
    pub documents_written: usize,
    pub hash_mismatches: Vec<HashMismatch>,
    pub backup_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LoggedContent {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    text: String,
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ReorderError {
    let path = path.to_path_buf();
    move |source| ReorderError::Io { path, source }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Rewrite `log_file` so its lines follow the canonical id order.
///
/// The log is scanned once to build an `id -> byte offset` index; only that
/// index is kept in memory. The original is renamed to `<log>.bak` before the
/// sorted copy takes its place. On any integrity failure the original is left
/// untouched.
pub fn reorder_log(request: &ReorderRequest) -> Result<ReorderReport, ReorderError> {
    let log_file = &request.log_file;

    let mut ordered_ids = Vec::new();
    let mut seen = HashSet::new();
    let mut expected_hashes = HashMap::new();
    for id_file in &request.id_files {
        for record in ManifestRecords::open(id_file)? {
            let record = record?;
            if request.check_hash {
                expected_hashes.insert(record.id.clone(), record.md5);
            }
            if seen.insert(record.id.clone()) {
                ordered_ids.push(record.id);
            }
        }
    }
    drop(seen);
    info!(ids = ordered_ids.len(), "read canonical id order");

    let file = File::open(log_file).map_err(io_at(log_file))?;
    let mut reader = BufReader::new(file);
    let mut offsets: HashMap<String, u64> = HashMap::with_capacity(ordered_ids.len());
    let mut duplicates: BTreeMap<String, usize> = BTreeMap::new();
    let mut hash_mismatches = Vec::new();
    let mut offset = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(io_at(log_file))?;
        if read == 0 {
            break;
        }
        let line_start = offset;
        offset += read as u64;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let doc: LoggedContent =
            serde_json::from_slice(&line).map_err(|source| ReorderError::MalformedLine {
                path: log_file.clone(),
                offset: line_start,
                source,
            })?;
        if let Some(expected) = expected_hashes.get(&doc.id) {
            let actual = fingerprint(&doc.title, &doc.text);
            if &actual != expected {
                warn!(
                    id = %doc.id,
                    expected = %expected,
                    actual = %actual,
                    "document hash mismatch"
                );
                hash_mismatches.push(HashMismatch {
                    id: doc.id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if offsets.insert(doc.id.clone(), line_start).is_some() {
            *duplicates.entry(doc.id).or_insert(1) += 1;
        }
    }

    if ordered_ids.len() != offsets.len() {
        return Err(ReorderError::CountMismatch {
            expected: ordered_ids.len(),
            found: offsets.len(),
        });
    }
    if let Some(missing) = ordered_ids.iter().find(|id| !offsets.contains_key(*id)) {
        return Err(ReorderError::MissingDocument(missing.clone()));
    }
    if let Some((id, count)) = duplicates.into_iter().next() {
        return Err(ReorderError::DuplicateDocument { id, count });
    }

    let sorted_path = sibling_with_suffix(log_file, ".sorted");
    let written = match write_in_order(log_file, &sorted_path, &ordered_ids, &offsets) {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&sorted_path);
            return Err(err);
        }
    };

    let backup_path = sibling_with_suffix(log_file, ".bak");
    info!(backup = %backup_path.display(), "backing up the original log");
    fs::rename(log_file, &backup_path).map_err(io_at(log_file))?;
    fs::rename(&sorted_path, log_file).map_err(io_at(&sorted_path))?;

    Ok(ReorderReport {
        documents_written: written,
        hash_mismatches,
        backup_path,
    })
}

fn write_in_order(
    log_file: &Path,
    sorted_path: &Path,
    ordered_ids: &[String],
    offsets: &HashMap<String, u64>,
) -> Result<usize, ReorderError> {
    let mut source = BufReader::new(File::open(log_file).map_err(io_at(log_file))?);
    let mut out = BufWriter::new(File::create(sorted_path).map_err(io_at(sorted_path))?);
    let mut line = Vec::new();
    for id in ordered_ids {
        let Some(&offset) = offsets.get(id) else {
            return Err(ReorderError::MissingDocument(id.clone()));
        };
        source.seek(SeekFrom::Start(offset)).map_err(io_at(log_file))?;
        line.clear();
        source.read_until(b'\n', &mut line).map_err(io_at(log_file))?;
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        out.write_all(&line).map_err(io_at(sorted_path))?;
    }
    out.flush().map_err(io_at(sorted_path))?;
    out.get_ref().sync_all().map_err(io_at(sorted_path))?;
    Ok(ordered_ids.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingKind {
    Relevant,
    NonRelevant,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDocument {
    pub id: String,
    pub kind: MissingKind,
}

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub missing: Vec<MissingDocument>,
}

impl AuditReport {
    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    pub fn count(&self, kind: MissingKind) -> usize {
        self.missing.iter().filter(|m| m.kind == kind).count()
    }
}

#[derive(Debug, Default)]
struct Judgments {
    relevant: HashSet<String>,
    non_relevant: HashSet<String>,
}

/// qrels lines: `qid iteration docid relevance`; relevance `0` is non-relevant.
fn read_judgments(paths: &[PathBuf]) -> anyhow::Result<Judgments> {
    let mut judgments = Judgments::default();
    for path in paths {
        let reader = open_text(path)?;
        for line in reader.lines() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 {
                continue;
            }
            let doc_id = cols[2].to_string();
            if cols[cols.len() - 1] == "0" {
                judgments.non_relevant.insert(doc_id);
            } else {
                judgments.relevant.insert(doc_id);
            }
        }
    }
    Ok(judgments)
}

/// Report every manifest id absent from `log_file`, classified by the qrels.
pub fn audit_collection(
    log_file: &Path,
    id_files: &[PathBuf],
    qrels: &[PathBuf],
) -> anyhow::Result<AuditReport> {
    let present = read_logged_ids(log_file)?;
    let judgments = read_judgments(qrels)?;

    let mut report = AuditReport::default();
    for id_file in id_files {
        for record in ManifestRecords::open(id_file)? {
            let id = record?.id;
            if present.contains(&id) {
                continue;
            }
            let kind = if judgments.relevant.contains(&id) {
                MissingKind::Relevant
            } else if judgments.non_relevant.contains(&id) {
                MissingKind::NonRelevant
            } else {
                MissingKind::Other
            };
            report.missing.push(MissingDocument { id, kind });
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::thread;
    use tempfile::tempdir;

    fn doc(id: &str, title: &str, text: &str) -> ExtractedDocument {
        ExtractedDocument {
            id: id.to_string(),
            source_archive: "crawl-data/seg/a.warc.gz".to_string(),
            time: None,
            title: title.to_string(),
            text: text.to_string(),
            url: format!("https://example.com/{id}"),
        }
    }

    fn doc_line(id: &str) -> String {
        let mut line = serde_json::to_string(&doc(id, &format!("title {id}"), "body")).unwrap();
        line.push('\n');
        line
    }

    fn manifest_line(id: &str, md5: &str) -> String {
        format!("{{\"id\": \"{id}\", \"cc_file\": \"crawl-data/seg/a.warc.gz\", \"md5\": \"{md5}\"}}\n")
    }

    fn write_manifest(path: &Path, ids: &[&str]) {
        let body: String = ids
            .iter()
            .map(|id| manifest_line(id, &fingerprint(&format!("title {id}"), "body")))
            .collect();
        fs::write(path, body).unwrap();
    }

    fn ids_in(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<LoggedId>(l).unwrap().id)
            .collect()
    }

    #[test]
    fn manifest_records_read_plain_and_gzip() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("ids.jsonl");
        fs::write(&plain, format!("{}\n{}", manifest_line("a", "h1"), manifest_line("b", "h2"))).unwrap();

        let gz = dir.path().join("ids.jsonl.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(manifest_line("c", "h3").as_bytes()).unwrap();
        enc.finish().unwrap();

        let plain_ids: Vec<_> = ManifestRecords::open(&plain)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(plain_ids, vec!["a", "b"]);

        let entry = ManifestRecords::open(&gz)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .into_entry(Language::Persian);
        assert_eq!(entry.document_id, "c");
        assert_eq!(entry.expected_fingerprint, "h3");
        assert_eq!(entry.source_archive, "crawl-data/seg/a.warc.gz");
        assert_eq!(entry.language, Language::Persian);
    }

    #[test]
    fn manifest_accepts_descriptive_field_aliases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.jsonl");
        fs::write(&path, r#"{"id":"x","source_archive":"arc","fingerprint":"ff"}"#).unwrap();
        let record = ManifestRecords::open(&path).unwrap().next().unwrap().unwrap();
        assert_eq!(record.cc_file, "arc");
        assert_eq!(record.md5, "ff");
    }

    #[test]
    fn malformed_manifest_line_reports_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.jsonl");
        fs::write(&path, format!("{}not json\n", manifest_line("a", "h"))).unwrap();
        let results: Vec<_> = ManifestRecords::open(&path).unwrap().collect();
        assert!(results[0].is_ok());
        let err = format!("{:#}", results[1].as_ref().unwrap_err());
        assert!(err.contains("line 2"), "{err}");
    }

    #[test]
    fn shard_sort_orders_numerically() {
        let paths = vec![
            PathBuf::from("ids.10.jsonl.gz"),
            PathBuf::from("ids.2.jsonl.gz"),
            PathBuf::from("ids.1.jsonl.gz"),
        ];
        let sorted = sort_manifests_by_shard(paths).unwrap();
        assert_eq!(
            sorted,
            vec![
                PathBuf::from("ids.1.jsonl.gz"),
                PathBuf::from("ids.2.jsonl.gz"),
                PathBuf::from("ids.10.jsonl.gz"),
            ]
        );
        assert!(matches!(
            sort_manifests_by_shard(vec![PathBuf::from("a.jsonl"), PathBuf::from("b.1.jsonl")]),
            Err(ReorderError::UnshardedManifest(_))
        ));
        assert_eq!(
            sort_manifests_by_shard(vec![PathBuf::from("plain.jsonl")]).unwrap(),
            vec![PathBuf::from("plain.jsonl")]
        );
    }

    #[test]
    fn concurrent_appends_produce_complete_lines() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rus.jsonl");
        let writer = AppendWriter::new(BTreeMap::from([(Language::Russian, log.clone())]));

        let workers = 8;
        let per_worker = 50;
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let writer = writer.clone();
                thread::spawn(move || {
                    let docs: Vec<_> = (0..per_worker)
                        .map(|i| doc(&format!("{w}-{i}"), "t", &"x".repeat(4096)))
                        .collect();
                    writer.append(Language::Russian, &docs).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), per_worker);
        }

        let content = fs::read_to_string(&log).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), workers * per_worker);
        let mut unique = HashSet::new();
        for line in lines {
            let parsed: ExtractedDocument = serde_json::from_str(line).unwrap();
            unique.insert(parsed.id);
        }
        assert_eq!(unique.len(), workers * per_worker);
    }

    #[test]
    fn append_to_unconfigured_language_fails() {
        let writer = AppendWriter::new(BTreeMap::new());
        assert!(matches!(
            writer.append(Language::Chinese, &[doc("a", "t", "x")]),
            Err(WriteError::UnknownLanguage(Language::Chinese))
        ));
    }

    #[test]
    fn ledger_records_and_recovers_completed_archives() {
        let dir = tempdir().unwrap();
        let ledger = CompletionLedger::new(dir.path().join("runs.log"));
        assert!(ledger.completed_archives().unwrap().is_empty());

        ledger.record_done("crawl-data/a.warc.gz").unwrap();
        ledger.record_done("crawl-data/b.warc.gz").unwrap();
        let mut file = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        file.write_all(b"2024-01-01 INFO something unrelated\n").unwrap();

        let done = ledger.completed_archives().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.contains("crawl-data/a.warc.gz"));
        assert!(done.contains("crawl-data/b.warc.gz"));
    }

    #[test]
    fn logged_ids_tolerate_missing_file() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("none.jsonl");
        assert!(read_logged_ids(&log).unwrap().is_empty());
        fs::write(&log, format!("{}{}", doc_line("a"), doc_line("b"))).unwrap();
        let ids = read_logged_ids(&log).unwrap();
        assert_eq!(ids, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn reorder_rewrites_log_in_canonical_order() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let ids = dir.path().join("ids.jsonl");
        write_manifest(&ids, &["a", "b", "c"]);
        let original = format!("{}{}{}", doc_line("c"), doc_line("a"), doc_line("b"));
        fs::write(&log, &original).unwrap();

        let request = ReorderRequest {
            log_file: log.clone(),
            id_files: vec![ids.clone()],
            check_hash: true,
        };
        let report = reorder_log(&request).unwrap();
        assert_eq!(report.documents_written, 3);
        assert!(report.hash_mismatches.is_empty());
        assert_eq!(ids_in(&log), vec!["a", "b", "c"]);
        assert_eq!(fs::read_to_string(&report.backup_path).unwrap(), original);
        assert!(!dir.path().join("hc4_docs.jsonl.sorted").exists());

        let first = fs::read(&log).unwrap();
        reorder_log(&request).unwrap();
        assert_eq!(fs::read(&log).unwrap(), first);
    }

    #[test]
    fn reorder_reports_hash_mismatches_without_aborting() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let ids = dir.path().join("ids.jsonl");
        fs::write(
            &ids,
            format!("{}{}", manifest_line("a", "deadbeef"), manifest_line("b", &fingerprint("title b", "body"))),
        )
        .unwrap();
        fs::write(&log, format!("{}{}", doc_line("b"), doc_line("a"))).unwrap();

        let report = reorder_log(&ReorderRequest {
            log_file: log.clone(),
            id_files: vec![ids],
            check_hash: true,
        })
        .unwrap();
        assert_eq!(report.hash_mismatches.len(), 1);
        assert_eq!(report.hash_mismatches[0].id, "a");
        assert_eq!(report.hash_mismatches[0].expected, "deadbeef");
        assert_eq!(ids_in(&log), vec!["a", "b"]);
    }

    #[test]
    fn reorder_with_missing_document_leaves_log_untouched() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let ids = dir.path().join("ids.jsonl");
        write_manifest(&ids, &["a", "b", "c", "d"]);
        let original = format!("{}{}{}", doc_line("c"), doc_line("a"), doc_line("b"));
        fs::write(&log, &original).unwrap();

        let err = reorder_log(&ReorderRequest {
            log_file: log.clone(),
            id_files: vec![ids],
            check_hash: false,
        })
        .unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(err, ReorderError::CountMismatch { expected: 4, found: 3 }));
        assert_eq!(fs::read_to_string(&log).unwrap(), original);
        assert!(!dir.path().join("hc4_docs.jsonl.bak").exists());
        assert!(!dir.path().join("hc4_docs.jsonl.sorted").exists());
    }

    #[test]
    fn reorder_rejects_duplicates_and_foreign_ids() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let ids = dir.path().join("ids.jsonl");
        write_manifest(&ids, &["a", "b"]);

        fs::write(&log, format!("{}{}{}", doc_line("a"), doc_line("b"), doc_line("a"))).unwrap();
        let request = ReorderRequest {
            log_file: log.clone(),
            id_files: vec![ids],
            check_hash: false,
        };
        assert!(matches!(
            reorder_log(&request),
            Err(ReorderError::DuplicateDocument { ref id, count: 2 }) if id == "a"
        ));

        fs::write(&log, format!("{}{}", doc_line("a"), doc_line("z"))).unwrap();
        assert!(matches!(
            reorder_log(&request),
            Err(ReorderError::MissingDocument(ref id)) if id == "b"
        ));
    }

    #[test]
    fn reorder_spans_sharded_manifests_in_given_order() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let first = dir.path().join("ids.1.jsonl");
        let second = dir.path().join("ids.2.jsonl");
        write_manifest(&first, &["b", "a"]);
        write_manifest(&second, &["d", "c"]);
        fs::write(
            &log,
            format!("{}{}{}{}", doc_line("a"), doc_line("b"), doc_line("c"), doc_line("d")),
        )
        .unwrap();

        let id_files = sort_manifests_by_shard(vec![second, first]).unwrap();
        reorder_log(&ReorderRequest {
            log_file: log.clone(),
            id_files,
            check_hash: false,
        })
        .unwrap();
        assert_eq!(ids_in(&log), vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn audit_classifies_missing_documents() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("hc4_docs.jsonl");
        let ids = dir.path().join("ids.jsonl");
        let qrels = dir.path().join("qrels.txt");
        write_manifest(&ids, &["a", "b", "c", "d"]);
        fs::write(&log, doc_line("a")).unwrap();
        fs::write(&qrels, "q1 0 b 3\nq1 0 c 0\n\nq2 0 a 1\n").unwrap();

        let report = audit_collection(&log, &[ids], &[qrels]).unwrap();
        assert_eq!(report.missing_count(), 3);
        assert_eq!(report.count(MissingKind::Relevant), 1);
        assert_eq!(report.count(MissingKind::NonRelevant), 1);
        assert_eq!(report.count(MissingKind::Other), 1);
        assert_eq!(
            report.missing[0],
            MissingDocument {
                id: "b".into(),
                kind: MissingKind::Relevant
            }
        );
    }

    #[test]
    fn layout_places_logs_per_language() {
        let layout = StorageLayout::new("/data/hc4");
        assert_eq!(
            layout.language_log(Language::Persian),
            PathBuf::from("/data/hc4/fas/hc4_docs.jsonl")
        );
        assert_eq!(layout.ledger_path(), PathBuf::from("/data/hc4/hc4_runs.log"));
    }
}
