use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use hc4_archive::{
    ArchiveRecord, ArchiveSource, Article, ArticleExtractor, BackoffPolicy, ExtractError,
    FetchError, RecordStream,
};
use hc4_core::{fingerprint, ExtractedDocument, Language};
use hc4_storage::{reorder_log, ReorderRequest, StorageLayout};
use hc4_sync::{ConfigurationError, DownloadConfig, DownloadPipeline, ResumePolicy, RunMode};
use tokio_util::sync::CancellationToken;

struct FixtureSource {
    archives: HashMap<String, Vec<ArchiveRecord>>,
}

impl ArchiveSource for FixtureSource {
    fn open(&self, archive: &str) -> Result<RecordStream<'_>, FetchError> {
        match self.archives.get(archive) {
            Some(records) => Ok(Box::new(records.clone().into_iter().map(Ok))),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: archive.to_string(),
            }),
        }
    }
}

struct LineExtractor;

impl ArticleExtractor for LineExtractor {
    fn extract(&self, record: &ArchiveRecord) -> Result<Article, ExtractError> {
        let payload = String::from_utf8_lossy(&record.payload);
        let (title, text) = payload.split_once('\n').unwrap_or((&payload, ""));
        Ok(Article {
            time: None,
            title: title.to_string(),
            text: text.to_string(),
        })
    }
}

fn record(id: &str) -> ArchiveRecord {
    ArchiveRecord {
        record_id: id.to_string(),
        target_uri: Some(format!("https://news.example/{id}")),
        payload: format!("Title {id}\nText of {id}.").into_bytes(),
    }
}

fn manifest_line(id: &str, archive: &str) -> String {
    format!(
        "{{\"id\":\"{id}\",\"cc_file\":\"{archive}\",\"md5\":\"{}\"}}\n",
        fingerprint(&format!("Title {id}"), &format!("Text of {id}."))
    )
}

fn source() -> Arc<FixtureSource> {
    Arc::new(FixtureSource {
        archives: HashMap::from([
            (
                "seg-1.warc.gz".to_string(),
                vec![record("r2"), record("noise"), record("r1"), record("f1")],
            ),
            ("seg-2.warc.gz".to_string(), vec![record("r3")]),
        ]),
    })
}

fn config(storage: &Path, manifests: &Path, mode: RunMode) -> DownloadConfig {
    DownloadConfig {
        storage_dir: storage.to_path_buf(),
        manifests: BTreeMap::from([
            (Language::Russian, vec![manifests.join("rus.jsonl")]),
            (Language::Persian, vec![manifests.join("fas.jsonl")]),
        ]),
        workers: 2,
        max_retries: 3,
        mode,
        resume_policy: ResumePolicy::Contents,
        validate_strict: true,
        backoff: BackoffPolicy::none(),
    }
}

fn logged_line(id: &str, archive: &str) -> String {
    let doc = ExtractedDocument {
        id: id.to_string(),
        source_archive: archive.to_string(),
        time: None,
        title: format!("Title {id}"),
        text: format!("Text of {id}."),
        url: format!("https://news.example/{id}"),
    };
    format!("{}\n", serde_json::to_string(&doc).unwrap())
}

/// rus manifest of three documents over two archives, empty fas manifest,
/// and a rus log already holding `captured`.
fn partial_run(storage: &Path, manifests: &Path, captured: &[(&str, &str)]) -> StorageLayout {
    fs::write(
        manifests.join("rus.jsonl"),
        [
            manifest_line("r1", "seg-1.warc.gz"),
            manifest_line("r2", "seg-1.warc.gz"),
            manifest_line("r3", "seg-2.warc.gz"),
        ]
        .concat(),
    )
    .unwrap();
    fs::write(manifests.join("fas.jsonl"), "").unwrap();

    let layout = StorageLayout::new(storage);
    let rus_log = layout.language_log(Language::Russian);
    fs::create_dir_all(rus_log.parent().unwrap()).unwrap();
    let lines: String = captured
        .iter()
        .map(|(id, archive)| logged_line(id, archive))
        .collect();
    fs::write(&rus_log, lines).unwrap();
    layout
}

fn sorted_ids(path: &Path) -> Vec<String> {
    let mut ids: Vec<String> = logged(path).into_iter().map(|d| d.id).collect();
    ids.sort();
    ids
}

fn logged(path: &Path) -> Vec<ExtractedDocument> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_resume_and_reorder() {
    let storage = tempfile::tempdir().unwrap();
    let manifests = tempfile::tempdir().unwrap();
    let rus_ids = manifests.path().join("rus.jsonl");
    fs::write(
        &rus_ids,
        [
            manifest_line("r1", "seg-1.warc.gz"),
            manifest_line("r2", "seg-1.warc.gz"),
            manifest_line("r3", "seg-2.warc.gz"),
        ]
        .concat(),
    )
    .unwrap();
    fs::write(
        manifests.path().join("fas.jsonl"),
        manifest_line("f1", "seg-1.warc.gz"),
    )
    .unwrap();

    let pipeline = DownloadPipeline::with_components(
        config(storage.path(), manifests.path(), RunMode::Fresh),
        source(),
        Arc::new(LineExtractor),
    );
    let summary = pipeline.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.archives_total, 2);
    assert_eq!(summary.archives_completed, 2);
    assert_eq!(summary.documents_written[&Language::Russian], 3);
    assert_eq!(summary.documents_written[&Language::Persian], 1);

    let layout = StorageLayout::new(storage.path());
    let rus_log = layout.language_log(Language::Russian);
    let docs = logged(&rus_log);
    assert_eq!(docs.len(), 3);
    let r1 = docs.iter().find(|d| d.id == "r1").unwrap();
    assert_eq!(r1.source_archive, "seg-1.warc.gz");
    assert_eq!(r1.url, "https://news.example/r1");
    assert_eq!(logged(&layout.language_log(Language::Persian))[0].id, "f1");
    assert!(fs::read_to_string(layout.ledger_path())
        .unwrap()
        .contains("done-cc-file:seg-2.warc.gz"));

    // A fresh run refuses to clobber existing output.
    let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::OutputExists(_))
    ));

    // Everything is already captured.
    let resumed = DownloadPipeline::with_components(
        config(storage.path(), manifests.path(), RunMode::Resume),
        source(),
        Arc::new(LineExtractor),
    );
    let err = resumed.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigurationError>(),
        Some(&ConfigurationError::NothingToCapture)
    );
    assert_eq!(logged(&rus_log).len(), 3);

    let report = reorder_log(&ReorderRequest {
        log_file: rus_log.clone(),
        id_files: vec![rus_ids],
        check_hash: true,
    })
    .unwrap();
    assert_eq!(report.documents_written, 3);
    assert!(report.hash_mismatches.is_empty());
    let order: Vec<String> = logged(&rus_log).into_iter().map(|d| d.id).collect();
    assert_eq!(order, ["r1", "r2", "r3"]);
    assert!(report.backup_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_discards_previous_output_and_missing_archive_is_skipped() {
    let storage = tempfile::tempdir().unwrap();
    let manifests = tempfile::tempdir().unwrap();
    fs::write(
        manifests.path().join("rus.jsonl"),
        [
            manifest_line("r3", "seg-2.warc.gz"),
            manifest_line("gone", "seg-404.warc.gz"),
        ]
        .concat(),
    )
    .unwrap();
    fs::write(manifests.path().join("fas.jsonl"), "").unwrap();

    let layout = StorageLayout::new(storage.path());
    let rus_log = layout.language_log(Language::Russian);
    fs::create_dir_all(rus_log.parent().unwrap()).unwrap();
    fs::write(&rus_log, "{\"id\":\"stale\"}\n").unwrap();

    let pipeline = DownloadPipeline::with_components(
        config(storage.path(), manifests.path(), RunMode::Restart),
        source(),
        Arc::new(LineExtractor),
    );
    let summary = pipeline.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.archives_total, 2);
    assert_eq!(summary.archives_completed, 1);
    assert_eq!(summary.archives_exhausted, 1);

    let ids: Vec<String> = logged(&rus_log).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, ["r3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_by_contents_fetches_only_remaining_ids() {
    let storage = tempfile::tempdir().unwrap();
    let manifests = tempfile::tempdir().unwrap();
    // seg-1 was interrupted after r1.
    let layout = partial_run(storage.path(), manifests.path(), &[("r1", "seg-1.warc.gz")]);

    let pipeline = DownloadPipeline::with_components(
        config(storage.path(), manifests.path(), RunMode::Resume),
        source(),
        Arc::new(LineExtractor),
    );
    let summary = pipeline.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.archives_total, 2);
    assert_eq!(summary.documents_wanted, 2);
    assert_eq!(summary.documents_written[&Language::Russian], 2);
    assert_eq!(
        sorted_ids(&layout.language_log(Language::Russian)),
        ["r1", "r2", "r3"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_by_ledger_skips_completed_archives() {
    let storage = tempfile::tempdir().unwrap();
    let manifests = tempfile::tempdir().unwrap();
    let layout = partial_run(storage.path(), manifests.path(), &[("r3", "seg-2.warc.gz")]);
    fs::write(layout.ledger_path(), "done-cc-file:seg-2.warc.gz\n").unwrap();

    let mut config = config(storage.path(), manifests.path(), RunMode::Resume);
    config.resume_policy = ResumePolicy::Ledger;
    let pipeline =
        DownloadPipeline::with_components(config, source(), Arc::new(LineExtractor));
    let summary = pipeline.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.archives_total, 1);
    assert_eq!(summary.archives_completed, 1);
    assert_eq!(summary.documents_written[&Language::Russian], 2);
    assert_eq!(
        sorted_ids(&layout.language_log(Language::Russian)),
        ["r1", "r2", "r3"]
    );
    let ledger = fs::read_to_string(layout.ledger_path()).unwrap();
    assert!(ledger.contains("done-cc-file:seg-1.warc.gz"));
    assert!(ledger.contains("done-cc-file:seg-2.warc.gz"));
}
