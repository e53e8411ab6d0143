//! Remote archive access for HC4: streamed WARC records over HTTP, payload
//! decoding, and article extraction from archived HTML.

use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use flate2::read::{GzDecoder, MultiGzDecoder, ZlibDecoder};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "hc4-archive";

pub const DEFAULT_BASE_URL: &str = "https://data.commoncrawl.org/";

const HTTP_RESPONSE_CONTENT_TYPE: &str = "application/http;msgtype=response";
const MAX_BLOCK_PREALLOC: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay between whole-archive attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading archive stream: {0}")]
    Io(#[from] io::Error),
    #[error("malformed archive record: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            // A dropped connection mid-stream surfaces as an io error or a
            // truncated record.
            FetchError::Io(_) | FetchError::Malformed(_) => RetryDisposition::Retryable,
        }
    }
}

/// One HTTP response record out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub record_id: String,
    pub target_uri: Option<String>,
    /// Raw HTTP response: status line, headers and body.
    pub payload: Vec<u8>,
}

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<ArchiveRecord, FetchError>> + Send + 'a>;

/// Opens archives by name as pull-based record streams.
///
/// Every call starts from the beginning of the archive. Dropping the stream
/// releases the underlying connection.
pub trait ArchiveSource: Send + Sync {
    fn open(&self, archive: &str) -> Result<RecordStream<'_>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    pub base_url: String,
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: Some("hc4-downloader/0.1".to_string()),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
        }
    }
}

impl ArchiveClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            base_url: std::env::var("HC4_ARCHIVE_BASE_URL").unwrap_or(defaults.base_url),
            user_agent: std::env::var("HC4_USER_AGENT").ok().or(defaults.user_agent),
            connect_timeout: secs("HC4_HTTP_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            read_timeout: secs("HC4_HTTP_READ_TIMEOUT_SECS", defaults.read_timeout),
        }
    }
}

/// Streams archives from `base_url + archive` with a blocking client; `.gz`
/// archives are decompressed member by member as they arrive.
#[derive(Debug)]
pub struct HttpArchiveSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpArchiveSource {
    pub fn new(config: ArchiveClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn archive_url(&self, archive: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            archive.trim_start_matches('/')
        )
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn open(&self, archive: &str) -> Result<RecordStream<'_>, FetchError> {
        let url = self.archive_url(archive);
        debug!(%url, "opening archive stream");
        let resp = self.client.get(&url).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body: Box<dyn BufRead + Send> = if archive.ends_with(".gz") {
            Box::new(BufReader::with_capacity(1 << 16, MultiGzDecoder::new(resp)))
        } else {
            Box::new(BufReader::with_capacity(1 << 16, resp))
        };
        Ok(Box::new(ResponseRecords::new(body)))
    }
}

/// Named fields of one WARC record header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarcHeader {
    pub version: String,
    fields: Vec<(String, String)>,
}

impl WarcHeader {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Result<u64, FetchError> {
        let raw = self
            .get("Content-Length")
            .ok_or_else(|| FetchError::Malformed("record without Content-Length".to_string()))?;
        raw.parse()
            .map_err(|_| FetchError::Malformed(format!("bad Content-Length `{raw}`")))
    }

    pub fn is_http_response(&self) -> bool {
        self.get("Content-Type").is_some_and(|ct| {
            ct.chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .eq_ignore_ascii_case(HTTP_RESPONSE_CONTENT_TYPE)
        })
    }
}

/// Sequential WARC record reader. Callers read each header and then either
/// read or skip its content block.
pub struct WarcReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, FetchError> {
        self.line.clear();
        if self.inner.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&self.line);
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Next record header, or `None` at a clean end of stream.
    pub fn next_header(&mut self) -> Result<Option<WarcHeader>, FetchError> {
        let version = loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            if !line.starts_with("WARC/") {
                let preview: String = line.chars().take(40).collect();
                return Err(FetchError::Malformed(format!(
                    "expected a WARC version line, found `{preview}`"
                )));
            }
            break line;
        };

        let mut fields: Vec<(String, String)> = Vec::new();
        loop {
            let line = self.read_line()?.ok_or_else(|| {
                FetchError::Malformed("archive ended inside a record header".to_string())
            })?;
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FetchError::Malformed(format!("bad header line `{line}`")))?;
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Some(WarcHeader { version, fields }))
    }

    pub fn read_block(&mut self, len: u64) -> Result<Vec<u8>, FetchError> {
        let mut block = Vec::with_capacity(len.min(MAX_BLOCK_PREALLOC) as usize);
        let read = (&mut self.inner).take(len).read_to_end(&mut block)? as u64;
        if read < len {
            return Err(truncated(len, read));
        }
        Ok(block)
    }

    pub fn skip_block(&mut self, len: u64) -> Result<(), FetchError> {
        let skipped = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        if skipped < len {
            return Err(truncated(len, skipped));
        }
        Ok(())
    }
}

fn truncated(expected: u64, got: u64) -> FetchError {
    FetchError::Malformed(format!(
        "record block truncated: expected {expected} bytes, got {got}"
    ))
}

/// `<urn:uuid:1234-...>` -> `1234-...`
pub fn normalize_record_id(raw: &str) -> String {
    let inner = raw.trim().trim_start_matches('<').trim_end_matches('>');
    match inner.split_once("uuid:") {
        Some((_, uuid)) => uuid.split('>').next().unwrap_or(uuid).to_string(),
        None => inner.to_string(),
    }
}

/// Iterator over the HTTP response records of a WARC stream. Other record
/// kinds are skipped without buffering their blocks. The first error ends the
/// sequence.
pub struct ResponseRecords<R> {
    reader: WarcReader<R>,
    done: bool,
}

impl<R: BufRead> ResponseRecords<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: WarcReader::new(inner),
            done: false,
        }
    }

    fn next_response(&mut self) -> Result<Option<ArchiveRecord>, FetchError> {
        while let Some(header) = self.reader.next_header()? {
            let len = header.content_length()?;
            if !header.is_http_response() {
                self.reader.skip_block(len)?;
                continue;
            }
            let raw_id = header.get("WARC-Record-ID").ok_or_else(|| {
                FetchError::Malformed("response record without WARC-Record-ID".to_string())
            })?;
            let record_id = normalize_record_id(raw_id);
            let target_uri = header.get("WARC-Target-URI").map(str::to_string);
            let payload = self.reader.read_block(len)?;
            return Ok(Some(ArchiveRecord {
                record_id,
                target_uri,
                payload,
            }));
        }
        Ok(None)
    }
}

impl<R: BufRead> Iterator for ResponseRecords<R> {
    type Item = Result<ArchiveRecord, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_response() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a raw HTTP response into lowercase-named headers and the body.
pub fn split_http_response(payload: &[u8]) -> (Vec<(String, String)>, &[u8]) {
    if !payload.starts_with(b"HTTP/") {
        return (Vec::new(), payload);
    }
    let (head, body) = match find_subsequence(payload, b"\r\n\r\n") {
        Some(pos) => (&payload[..pos], &payload[pos + 4..]),
        None => match find_subsequence(payload, b"\n\n") {
            Some(pos) => (&payload[..pos], &payload[pos + 2..]),
            None => (payload, &payload[payload.len()..]),
        },
    };
    let headers = String::from_utf8_lossy(head)
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    (headers, body)
}

fn dechunk(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    loop {
        let line_end = pos + find_subsequence(&body[pos..], b"\r\n")?;
        let size_text = std::str::from_utf8(&body[pos..line_end]).ok()?;
        let size_text = size_text.split(';').next()?.trim();
        let size = usize::from_str_radix(size_text, 16).ok()?;
        pos = line_end + 2;
        if size == 0 {
            return Some(out);
        }
        let end = pos.checked_add(size)?;
        out.extend_from_slice(body.get(pos..end)?);
        pos = end;
        if body.get(pos..pos.checked_add(2)?) == Some(b"\r\n") {
            pos += 2;
        }
    }
}

fn decode_all(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// HTTP body with transfer and content encodings removed. Encodings that
/// fail to decode leave the bytes as they were.
pub fn http_body(payload: &[u8]) -> Vec<u8> {
    let (headers, body) = split_http_response(payload);
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.to_ascii_lowercase())
    };

    let mut body = body.to_vec();
    if header("transfer-encoding").is_some_and(|te| te.contains("chunked")) {
        if let Some(dechunked) = dechunk(&body) {
            body = dechunked;
        }
    }
    match header("content-encoding").as_deref() {
        Some("gzip") | Some("x-gzip") => {
            if let Some(decoded) = decode_all(GzDecoder::new(body.as_slice())) {
                body = decoded;
            }
        }
        Some("deflate") => {
            if let Some(decoded) = decode_all(ZlibDecoder::new(body.as_slice())) {
                body = decoded;
            }
        }
        _ => {}
    }
    body
}

/// Article fields pulled out of one archived page.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub time: Option<DateTime<FixedOffset>>,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("record {0} has an empty HTTP body")]
    EmptyBody(String),
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("no readable content in record {0}")]
    NoContent(String),
}

pub trait ArticleExtractor: Send + Sync {
    fn extract(&self, record: &ArchiveRecord) -> Result<Article, ExtractError>;
}

/// Main-content extractor: readability picks the headline and the body
/// container, the page DOM supplies the publish time.
#[derive(Debug, Clone, Default)]
pub struct HtmlArticleExtractor;

/// Base for resolving relative links when the record has no usable target URI.
const FALLBACK_PAGE_URL: &str = "http://localhost/";

const PUBLISH_TIME_SOURCES: [(&str, &str); 6] = [
    ("meta[property='article:published_time']", "content"),
    ("meta[itemprop='datePublished']", "content"),
    ("meta[name='pubdate']", "content"),
    ("meta[name='publishdate']", "content"),
    ("meta[name='date']", "content"),
    ("time[datetime]", "datetime"),
];

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

fn collapse_whitespace(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .find_map(|n| collapse_whitespace(&n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| collapse_whitespace(&n.text().collect::<String>()))
        .collect())
}

fn page_url(record: &ArchiveRecord) -> Result<Url, ExtractError> {
    match record.target_uri.as_deref().map(Url::parse) {
        Some(Ok(url)) => Ok(url),
        _ => Url::parse(FALLBACK_PAGE_URL)
            .map_err(|_| ExtractError::NoContent(record.record_id.clone())),
    }
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .find_map(|n| n.value().attr(attr).and_then(collapse_whitespace)))
}

pub fn parse_publish_time(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc().fixed_offset())
}

impl HtmlArticleExtractor {
    /// Readability's `<title>`, else OpenGraph, else the first `<h1>`.
    fn title(&self, readable: &str, document: &Html) -> Result<String, ExtractError> {
        if let Some(title) = collapse_whitespace(readable) {
            return Ok(title);
        }
        Ok(select_first_attr(document, "meta[property='og:title']", "content")?
            .or(select_first_text(document, "h1")?)
            .unwrap_or_default())
    }

    /// Paragraphs of the cleaned content joined by blank lines.
    fn text(&self, content: &str, plain: &str) -> Result<String, ExtractError> {
        let fragment = Html::parse_fragment(content);
        let paragraphs = select_all_texts(&fragment, "p")?;
        if paragraphs.is_empty() {
            return Ok(collapse_whitespace(plain).unwrap_or_default());
        }
        Ok(paragraphs.join("\n\n"))
    }

    fn publish_time(&self, document: &Html) -> Result<Option<DateTime<FixedOffset>>, ExtractError> {
        for (selector, attr) in PUBLISH_TIME_SOURCES {
            if let Some(ts) = select_first_attr(document, selector, attr)?
                .as_deref()
                .and_then(parse_publish_time)
            {
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }
}

impl ArticleExtractor for HtmlArticleExtractor {
    fn extract(&self, record: &ArchiveRecord) -> Result<Article, ExtractError> {
        let body = http_body(&record.payload);
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ExtractError::EmptyBody(record.record_id.clone()));
        }
        let url = page_url(record)?;
        let mut cursor = Cursor::new(body.as_slice());
        let product = readability::extractor::extract(&mut cursor, &url)
            .map_err(|_| ExtractError::NoContent(record.record_id.clone()))?;

        let html = String::from_utf8_lossy(&body);
        let document = Html::parse_document(&html);
        Ok(Article {
            time: self.publish_time(&document)?,
            title: self.title(&product.title, &document)?,
            text: self.text(&product.content, &product.text)?,
        })
    }
}
