//! Byte streams for rate documents.
//!
//! Remote bodies are pumped by a tokio task through a bounded channel into a
//! blocking [`Read`] adapter, so the decoder can run on a blocking thread while
//! at most a few chunks of the document are held in memory.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use tokio::sync::mpsc;

use crate::common::{
    apply_download_progress_style, apply_spinner_style, is_transient_status, next_backoff,
    retry_after_delay, truncate_for_log,
};
use crate::error::{DecodeError, FetchError};

const CHANNEL_CHUNKS: usize = 16;
const READ_BUFFER_BYTES: usize = 256 * 1024;
const USER_AGENT: &str = concat!("tic-rates/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Remote(String),
    Local(PathBuf),
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::InvalidLocation(raw.to_string()));
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Self::Remote(trimmed.to_string()));
        }
        if lower.starts_with("file://") {
            let path = &trimmed["file://".len()..];
            if path.is_empty() {
                return Err(FetchError::InvalidLocation(raw.to_string()));
            }
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if trimmed.contains("://") {
            return Err(FetchError::InvalidLocation(raw.to_string()));
        }
        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether a document read from `self` may follow a location it names.
    /// Remote documents only reach other remote locations.
    pub fn may_follow(&self, cited: &Location) -> bool {
        !self.is_remote() || cited.is_remote()
    }
}

/// Raw (possibly compressed) bytes of one document.
pub struct DocumentStream {
    source: String,
    reader: Box<dyn Read + Send>,
    progress: Option<ProgressBar>,
}

impl DocumentStream {
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Read for DocumentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        if let Some(progress) = &self.progress {
            progress.inc(n as u64);
        }
        Ok(n)
    }
}

impl Drop for DocumentStream {
    fn drop(&mut self) {
        if let Some(progress) = self.progress.take() {
            progress.finish_and_clear();
        }
    }
}

pub struct Fetcher {
    client: Client,
    max_retries: usize,
    initial_backoff: Duration,
    progress: Option<Arc<MultiProgress>>,
}

impl Fetcher {
    pub fn new(max_retries: usize) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self {
            client,
            max_retries,
            initial_backoff: Duration::from_secs(1),
            progress: None,
        })
    }

    pub fn with_progress(mut self, hub: Arc<MultiProgress>) -> Self {
        self.progress = Some(hub);
        self
    }

    /// Opens `location` for streaming. Must be called inside a tokio runtime;
    /// the returned stream must be read from a blocking thread.
    pub async fn open(&self, location: &str) -> Result<DocumentStream, FetchError> {
        match Location::parse(location)? {
            Location::Local(path) => {
                let file = File::open(&path).map_err(|source| FetchError::Local {
                    path: path.display().to_string(),
                    source,
                })?;
                let total = file.metadata().ok().map(|m| m.len());
                Ok(DocumentStream {
                    source: location.to_string(),
                    reader: Box::new(file),
                    progress: self.progress_bar(location, total),
                })
            }
            Location::Remote(url) => {
                let response = self.send_with_retry(&url).await?;
                let total = response.content_length();
                let reader = spawn_body_pump(url.clone(), response);
                Ok(DocumentStream {
                    source: location.to_string(),
                    reader: Box::new(reader),
                    progress: self.progress_bar(location, total),
                })
            }
        }
    }

    async fn send_with_retry(&self, url: &str) -> Result<Response, FetchError> {
        let attempts = self.max_retries.max(1);
        let mut backoff = self.initial_backoff;

        for attempt in 1..=attempts {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after =
                        retry_after_delay(resp.headers().get(RETRY_AFTER), Utc::now());
                    let body = resp.text().await.unwrap_or_default();
                    if is_transient_status(status) && attempt < attempts {
                        tracing::warn!(
                            "retryable status {status} for {url} (attempt {attempt}/{attempts})"
                        );
                        tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                        body: truncate_for_log(&body),
                    });
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            message: err.to_string(),
                        });
                    }
                    tracing::warn!("request failed for {url} (attempt {attempt}/{attempts}): {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }

        Err(FetchError::Request {
            url: url.to_string(),
            message: "no request attempted".to_string(),
        })
    }

    fn progress_bar(&self, location: &str, total: Option<u64>) -> Option<ProgressBar> {
        let hub = self.progress.as_ref()?;
        let bar = match total {
            Some(len) if len > 0 => {
                let bar = hub.add(ProgressBar::new(len));
                apply_download_progress_style(&bar);
                bar
            }
            _ => {
                let bar = hub.add(ProgressBar::new_spinner());
                apply_spinner_style(&bar);
                bar
            }
        };
        bar.set_prefix(short_name(location));
        bar.enable_steady_tick(Duration::from_millis(200));
        Some(bar)
    }
}

fn short_name(location: &str) -> String {
    let trimmed = location.trim().trim_end_matches('/');
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    without_query
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(without_query)
        .to_string()
}

fn spawn_body_pump(url: String, response: Response) -> ChannelReader {
    let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>(CHANNEL_CHUNKS);
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let item = chunk.map(|bytes| bytes.to_vec()).map_err(|err| {
                io::Error::other(FetchError::Interrupted {
                    url: url.clone(),
                    message: err.to_string(),
                })
            });
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    ChannelReader::new(rx)
}

/// Blocking reader over chunks delivered by an async producer.
///
/// Uses `blocking_recv`, so it panics if read from inside an async context.
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Plain,
    Gzip,
    Zip,
}

pub fn sniff(head: &[u8]) -> Container {
    if head.starts_with(&[0x1f, 0x8b]) {
        Container::Gzip
    } else if head.starts_with(b"PK\x03\x04") {
        Container::Zip
    } else {
        Container::Plain
    }
}

/// Hands every JSON document carried by `reader` to `visit`, decompressed.
///
/// Plain and gzip payloads are a single document named `source`. Zip
/// payloads yield each `.json` / `.json.gz` member as `"<source>#<member>"`.
pub fn for_each_document<R, F>(reader: R, source: &str, mut visit: F) -> Result<usize, DecodeError>
where
    R: Read,
    F: FnMut(&str, &mut dyn Read) -> Result<(), DecodeError>,
{
    let mut reader = reader;
    let mut head = Vec::with_capacity(4);
    (&mut reader)
        .take(4)
        .read_to_end(&mut head)
        .map_err(DecodeError::Read)?;
    let container = sniff(&head);
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, Cursor::new(head).chain(reader));

    match container {
        Container::Plain => {
            visit(source, &mut reader)?;
            Ok(1)
        }
        Container::Gzip => {
            let mut gz = MultiGzDecoder::new(reader);
            visit(source, &mut gz)?;
            Ok(1)
        }
        Container::Zip => {
            let mut documents = 0usize;
            loop {
                let member = zip::read::read_zipfile_from_stream(&mut reader)
                    .map_err(|err| zip_failure(source, err))?;
                let Some(mut member) = member else {
                    break;
                };
                if member.is_dir() {
                    continue;
                }
                let name = member.name().to_string();
                let lower = name.to_ascii_lowercase();
                let member_source = format!("{source}#{name}");
                if lower.ends_with(".json.gz") {
                    let mut gz = MultiGzDecoder::new(&mut member);
                    visit(&member_source, &mut gz)?;
                } else if lower.ends_with(".json") {
                    visit(&member_source, &mut member)?;
                } else {
                    tracing::debug!("skipping non-JSON archive member {member_source}");
                    continue;
                }
                documents += 1;
            }
            if documents == 0 {
                return Err(DecodeError::Archive(format!(
                    "{source} contains no JSON members"
                )));
            }
            Ok(documents)
        }
    }
}

fn zip_failure(source: &str, err: zip::result::ZipError) -> DecodeError {
    match err {
        zip::result::ZipError::Io(io_err) => DecodeError::Read(io_err),
        other => DecodeError::Archive(format!("{source}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn collect(payload: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
        let mut seen = Vec::new();
        for_each_document(payload, "https://example.com/a", |name, reader| {
            let mut text = String::new();
            reader.read_to_string(&mut text).map_err(DecodeError::Read)?;
            seen.push((name.to_string(), text));
            Ok(())
        })?;
        Ok(seen)
    }

    #[test]
    fn locations() {
        assert_eq!(
            Location::parse(" https://example.com/x.json ").unwrap(),
            Location::Remote("https://example.com/x.json".to_string())
        );
        assert_eq!(
            Location::parse("file:///tmp/x.json").unwrap(),
            Location::Local(PathBuf::from("/tmp/x.json"))
        );
        assert_eq!(
            Location::parse("data/x.json").unwrap(),
            Location::Local(PathBuf::from("data/x.json"))
        );
        assert!(Location::parse("ftp://example.com/x").is_err());
        assert!(Location::parse("  ").is_err());
    }

    #[test]
    fn remote_documents_only_follow_remote_locations() {
        let remote = Location::parse("https://example.com/in-network.json").unwrap();
        let local = Location::parse("/tmp/in-network.json").unwrap();
        let remote_ref = Location::parse("https://example.com/refs/123.json").unwrap();
        let local_ref = Location::parse("file:///etc/passwd").unwrap();

        assert!(remote.may_follow(&remote_ref));
        assert!(!remote.may_follow(&local_ref));
        assert!(local.may_follow(&local_ref));
        assert!(local.may_follow(&remote_ref));
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(sniff(&[0x1f, 0x8b, 8, 0]), Container::Gzip);
        assert_eq!(sniff(b"PK\x03\x04"), Container::Zip);
        assert_eq!(sniff(b"{\"a\""), Container::Plain);
        assert_eq!(sniff(b""), Container::Plain);
    }

    #[test]
    fn plain_and_gzip_payloads_are_one_document() {
        let plain = collect(br#"{"in_network": []}"#).unwrap();
        assert_eq!(plain, vec![("https://example.com/a".to_string(), r#"{"in_network": []}"#.to_string())]);

        let gz = collect(&gzip(br#"{"in_network": [1]}"#)).unwrap();
        assert_eq!(gz[0].1, r#"{"in_network": [1]}"#);
    }

    #[test]
    fn zip_members_become_documents() {
        use zip::write::SimpleFileOptions;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("readme.txt", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"not json").unwrap();
        writer.start_file("first.json", SimpleFileOptions::default()).unwrap();
        writer.write_all(br#"{"a": 1}"#).unwrap();
        writer.start_file("second.json.gz", SimpleFileOptions::default()).unwrap();
        writer.write_all(&gzip(br#"{"b": 2}"#)).unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let docs = collect(&archive).unwrap();
        assert_eq!(
            docs,
            vec![
                ("https://example.com/a#first.json".to_string(), r#"{"a": 1}"#.to_string()),
                ("https://example.com/a#second.json.gz".to_string(), r#"{"b": 2}"#.to_string()),
            ]
        );
    }

    #[test]
    fn zip_without_json_members_is_rejected() {
        use zip::write::SimpleFileOptions;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("readme.txt", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"nothing here").unwrap();
        let archive = writer.finish().unwrap().into_inner();
        assert!(matches!(collect(&archive), Err(DecodeError::Archive(_))));
    }

    #[test]
    fn short_names() {
        assert_eq!(short_name("https://example.com/dir/file.json.gz?sig=abc"), "file.json.gz");
        assert_eq!(short_name("local.json"), "local.json");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn channel_reader_reassembles_chunks_and_surfaces_interruptions() {
        let (tx, rx) = mpsc::channel(2);
        let producer = tokio::spawn(async move {
            tx.send(Ok(b"{\"in_".to_vec())).await.unwrap();
            tx.send(Ok(b"network\"".to_vec())).await.unwrap();
            tx.send(Err(io::Error::other(FetchError::Interrupted {
                url: "https://example.com/a".to_string(),
                message: "connection reset".to_string(),
            })))
            .await
            .unwrap();
        });

        let (text, err) = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let mut text = Vec::new();
            let mut buf = [0u8; 3];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => return (text, None),
                    Ok(n) => text.extend_from_slice(&buf[..n]),
                    Err(err) => return (text, Some(err)),
                }
            }
        })
        .await
        .unwrap();
        producer.await.unwrap();

        assert_eq!(text, b"{\"in_network\"");
        let ingest = IngestError::from(DecodeError::Read(err.unwrap()));
        assert_eq!(ingest.kind(), "fetch");
    }

    #[tokio::test]
    async fn opens_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, br#"{"in_network": []}"#).unwrap();

        let fetcher = Fetcher::new(1).unwrap();
        let mut stream = fetcher.open(path.to_str().unwrap()).await.unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, r#"{"in_network": []}"#);

        let missing = fetcher.open(dir.path().join("missing.json").to_str().unwrap()).await;
        assert!(matches!(missing, Err(FetchError::Local { .. })));
    }
}
