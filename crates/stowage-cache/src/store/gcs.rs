//! Google Cloud Storage backend over HTTPS.
//!
//! Metadata, downloads and listings use the JSON API; uploads use an XML API
//! `PUT` so the `Content-Type` and `Cache-Control` attributes are set from
//! request headers while the body streams with chunked transfer encoding.

use super::{ObjectMetadata, ObjectReader, ObjectStore, ObjectWriter, WriteOptions};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use stowage_core::{Error, Result};
use tracing::{debug, trace};
use url::Url;

/// Public Cloud Storage endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

const USER_AGENT: &str = concat!("stowage/", env!("CARGO_PKG_VERSION"));
const CHUNK_SIZE: usize = 256 * 1024;
/// Chunks buffered between the writer and the upload thread.
const CHUNK_BACKLOG: usize = 4;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    updated: DateTime<Utc>,
    #[serde(default)]
    size: Option<String>,
    content_type: Option<String>,
}

impl From<ObjectResource> for ObjectMetadata {
    fn from(resource: ObjectResource) -> Self {
        ObjectMetadata {
            size_bytes: resource
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            key: resource.name,
            last_modified: resource.updated,
            content_type: resource.content_type,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

/// Cloud Storage client. The store location is the bucket name.
pub struct GcsStore {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl GcsStore {
    /// Build a store against `endpoint`, authenticating with an optional OAuth2 bearer token.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::InvalidRequest(format!("invalid endpoint {}: {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidRequest(format!(
                "invalid endpoint {}: not a base URL",
                endpoint
            )));
        }

        // No request timeout: an archive upload takes as long as it takes.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| Error::Store(format!("failed to create storage client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    fn url_with<I>(&self, segments: I) -> Url
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// JSON API resource URL; the whole key is a single escaped segment.
    fn object_url(&self, bucket: &str, key: &str) -> Url {
        self.url_with(["storage", "v1", "b", bucket, "o", key])
    }

    fn list_url(&self, bucket: &str) -> Url {
        self.url_with(["storage", "v1", "b", bucket, "o"])
    }

    /// XML API URL; key segments map onto path segments.
    fn upload_url(&self, bucket: &str, key: &str) -> Url {
        self.url_with(std::iter::once(bucket).chain(key.split('/')))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        authorize(request, self.token.as_deref())
    }

    fn get(&self, url: &Url) -> Result<Response> {
        trace!(%url, "GET");
        self.authorize(self.client.get(url.clone()))
            .send()
            .map_err(|e| Error::Store(format!("failed to request {}: {}", url, e)))
    }
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn check_status(response: Response, action: &str, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(Error::Store(format!(
        "failed to {} {}: {} {}",
        action,
        url,
        status,
        body.trim()
    )))
}

impl ObjectStore for GcsStore {
    fn open_writer(
        &self,
        location: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        let url = self.upload_url(location, key);
        let (sender, receiver) = mpsc::sync_channel(CHUNK_BACKLOG);

        let request = self
            .authorize(self.client.put(url.clone()))
            .header(CONTENT_TYPE, options.content_type.as_str())
            .header(CACHE_CONTROL, options.cache_control.as_str());
        let upload_url = url.clone();
        let upload = thread::Builder::new()
            .name("stowage-upload".to_string())
            .spawn(move || {
                let response = request
                    .body(Body::new(ChannelReader::new(receiver)))
                    .send()
                    .map_err(|e| Error::Store(format!("failed to upload {}: {}", upload_url, e)))?;
                check_status(response, "upload", &upload_url)?;
                Ok(())
            })
            .map_err(|e| Error::Store(format!("failed to start upload of {}: {}", url, e)))?;

        debug!(%url, "Opened upload");
        Ok(Box::new(GcsWriter {
            sender: Some(sender),
            buf: Vec::with_capacity(CHUNK_SIZE),
            upload: Some(upload),
            url,
        }))
    }

    fn open_reader(&self, location: &str, key: &str) -> Result<Box<dyn ObjectReader>> {
        let mut url = self.object_url(location, key);
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self.get(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(location, key));
        }
        let response = check_status(response, "download", &url)?;
        Ok(Box::new(GcsReader { response }))
    }

    fn metadata(&self, location: &str, key: &str) -> Result<ObjectMetadata> {
        let url = self.object_url(location, key);
        let response = self.get(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(location, key));
        }
        let resource: ObjectResource = check_status(response, "get attributes of", &url)?
            .json()
            .map_err(|e| Error::Store(format!("invalid attributes for {}: {}", url, e)))?;
        Ok(resource.into())
    }

    fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        let mut entries = vec![];
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.list_url(location);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let page: ObjectList = check_status(self.get(&url)?, "list", &url)?
                .json()
                .map_err(|e| Error::Store(format!("invalid listing from {}: {}", url, e)))?;
            entries.extend(page.items.into_iter().map(ObjectMetadata::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

enum Chunk {
    Data(Vec<u8>),
    Abort,
}

/// Request body fed from the writer. A dropped sender ends the body cleanly;
/// an explicit abort fails it so the store never commits the object.
struct ChannelReader {
    receiver: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(receiver: Receiver<Chunk>) -> Self {
        Self {
            receiver,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.receiver.recv() {
                Ok(Chunk::Data(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Chunk::Abort) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "upload aborted",
                    ));
                }
                Err(_) => return Ok(0),
            }
        }

        let n = (&self.current[self.pos..]).read(buf)?;
        self.pos += n;
        Ok(n)
    }
}

struct GcsWriter {
    sender: Option<SyncSender<Chunk>>,
    buf: Vec<u8>,
    upload: Option<JoinHandle<Result<()>>>,
    url: Url,
}

impl GcsWriter {
    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload already closed"))?;
        sender.send(Chunk::Data(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "upload terminated by the store")
        })
    }

    fn join(&mut self) -> Result<()> {
        match self.upload.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Store(format!("upload of {} panicked", self.url)))?,
            None => Ok(()),
        }
    }
}

impl Write for GcsWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffer()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}

impl ObjectWriter for GcsWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let flushed = self.send_buffer();
        drop(self.sender.take());
        self.join()?;
        flushed.map_err(|e| Error::Store(format!("failed to upload {}: {}", self.url, e)))?;
        debug!(url = %self.url, "Upload finished");
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        let delivered = match self.sender.take() {
            Some(sender) => sender.send(Chunk::Abort).is_ok(),
            None => false,
        };
        let outcome = self.join();
        if delivered {
            // The upload failed because it was told to.
            trace!(url = %self.url, "Upload aborted");
            return Ok(());
        }
        outcome
    }
}

impl Drop for GcsWriter {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Chunk::Abort);
        }
    }
}

struct GcsReader {
    response: Response,
}

impl Read for GcsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf).map_err(|e| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("failed to read object stream: {}", e),
            )
        })
    }
}

impl ObjectReader for GcsReader {
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CACHE_CONTROL as GZIP_CACHE_CONTROL, CONTENT_TYPE as GZIP};
    use pretty_assertions::assert_eq;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    /// One request as seen by the test server.
    struct Captured {
        head: String,
        body: Vec<u8>,
        /// Whether a chunked body ended with its terminating zero-length chunk.
        complete: bool,
    }

    /// Answer one connection per response, in order, capturing each request.
    fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<Captured>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            responses
                .into_iter()
                .map(|response| {
                    let (mut stream, _) = listener.accept().unwrap();
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let head = read_head(&mut reader);
                    let (body, complete) = if head
                        .to_lowercase()
                        .contains("transfer-encoding: chunked")
                    {
                        read_chunked(&mut reader)
                    } else {
                        (Vec::new(), true)
                    };
                    // The client may already have hung up after an abort.
                    let _ = stream.write_all(response.as_bytes());
                    Captured {
                        head,
                        body,
                        complete,
                    }
                })
                .collect()
        });
        (endpoint, handle)
    }

    fn serve_once(response: String) -> (String, JoinHandle<Vec<Captured>>) {
        serve(vec![response])
    }

    fn read_head(reader: &mut impl BufRead) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }
        head
    }

    fn read_chunked(reader: &mut impl BufRead) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return (body, false),
                Ok(_) => {}
            }
            let Ok(size) = usize::from_str_radix(line.trim(), 16) else {
                return (body, false);
            };
            if size == 0 {
                let mut trailer = String::new();
                let complete = reader.read_line(&mut trailer).is_ok() && trailer == "\r\n";
                return (body, complete);
            }
            let mut chunk = vec![0; size + 2];
            if reader.read_exact(&mut chunk).is_err() {
                return (body, false);
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    fn response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        )
    }

    fn json_response(status: &str, body: &str) -> String {
        response(status, "application/json", body)
    }

    fn single(server: JoinHandle<Vec<Captured>>) -> Captured {
        server.join().unwrap().remove(0)
    }

    fn gzip_options() -> WriteOptions {
        WriteOptions::new(GZIP, GZIP_CACHE_CONTROL)
    }

    #[test]
    fn test_urls_escape_keys() {
        let store = GcsStore::new(DEFAULT_ENDPOINT, None).unwrap();
        assert_eq!(
            store.object_url("ci-cache", "cargo/linux x").as_str(),
            "https://storage.googleapis.com/storage/v1/b/ci-cache/o/cargo%2Flinux%20x"
        );
        assert_eq!(
            store.upload_url("ci-cache", "cargo/linux x").as_str(),
            "https://storage.googleapis.com/ci-cache/cargo/linux%20x"
        );
    }

    #[test]
    fn test_endpoint_with_path_prefix() {
        let store = GcsStore::new("http://localhost:4443/gcs/", None).unwrap();
        assert_eq!(
            store.list_url("b").as_str(),
            "http://localhost:4443/gcs/storage/v1/b/b/o"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(GcsStore::new("not a url", None).is_err());
        assert!(GcsStore::new("mailto:someone@example.com", None).is_err());
    }

    #[test]
    fn test_object_resource_conversion() {
        let resource: ObjectResource = serde_json::from_str(
            r#"{"name":"npm-abc","updated":"2024-03-01T12:30:00.123Z","size":"2048","contentType":"application/gzip"}"#,
        )
        .unwrap();
        let meta = ObjectMetadata::from(resource);
        assert_eq!(meta.key, "npm-abc");
        assert_eq!(meta.size_bytes, 2048);
        assert_eq!(meta.content_type.as_deref(), Some("application/gzip"));
        assert_eq!(meta.last_modified.timestamp_millis(), 1709296200123);
    }

    #[test]
    fn test_metadata_not_found() {
        let (endpoint, server) = serve_once(json_response("404 Not Found", "{}"));
        let store = GcsStore::new(&endpoint, Some("t0ken".to_string())).unwrap();

        let err = store.metadata("bucket", "missing/key").unwrap_err();
        assert!(err.is_not_found(), "{err}");

        let request = single(server);
        assert!(request.head.starts_with("GET /storage/v1/b/bucket/o/missing%2Fkey HTTP/1.1"));
        assert!(request.head.to_lowercase().contains("authorization: bearer t0ken"));
    }

    #[test]
    fn test_metadata_found() {
        let body = r#"{"name":"k","updated":"2024-03-01T12:30:00Z","size":"10"}"#;
        let (endpoint, server) = serve_once(json_response("200 OK", body));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let meta = store.metadata("bucket", "k").unwrap();
        assert_eq!(meta.key, "k");
        assert_eq!(meta.size_bytes, 10);
        server.join().unwrap();
    }

    #[test]
    fn test_metadata_server_error_is_store_error() {
        let (endpoint, server) = serve_once(json_response("403 Forbidden", "denied"));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let err = store.metadata("bucket", "k").unwrap_err();
        assert!(matches!(err, Error::Store(ref msg) if msg.contains("403")), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn test_finish_publishes_complete_upload() {
        let (endpoint, server) = serve_once(response("200 OK", "text/plain", ""));
        let store = GcsStore::new(&endpoint, Some("t0ken".to_string())).unwrap();

        let payload = vec![0x5a_u8; CHUNK_SIZE + 1234];
        let mut writer = store.open_writer("b", "k/x", &gzip_options()).unwrap();
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let request = single(server);
        let head = request.head.to_lowercase();
        assert!(request.head.starts_with("PUT /b/k/x HTTP/1.1"), "{}", request.head);
        assert!(head.contains("content-type: application/gzip"));
        assert!(head.contains("cache-control: public,max-age=3600"));
        assert!(head.contains("authorization: bearer t0ken"));
        assert!(request.complete);
        assert_eq!(request.body, payload);
    }

    #[test]
    fn test_finish_reports_rejected_upload() {
        let (endpoint, server) = serve_once(response("403 Forbidden", "text/plain", "nope"));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let mut writer = store.open_writer("b", "k", &gzip_options()).unwrap();
        writer.write_all(b"archive").unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, Error::Store(ref msg) if msg.contains("403")), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn test_abort_leaves_upload_unterminated() {
        let (endpoint, server) = serve_once(response("200 OK", "text/plain", ""));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let mut writer = store.open_writer("b", "k", &gzip_options()).unwrap();
        writer.write_all(&vec![1_u8; 2 * CHUNK_SIZE + 100]).unwrap();
        writer.abort().unwrap();

        let request = single(server);
        assert!(request.head.starts_with("PUT /b/k HTTP/1.1"));
        assert!(!request.complete);
    }

    #[test]
    fn test_dropped_writer_leaves_upload_unterminated() {
        let (endpoint, server) = serve_once(response("200 OK", "text/plain", ""));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let mut writer = store.open_writer("b", "k", &gzip_options()).unwrap();
        writer.write_all(&vec![2_u8; CHUNK_SIZE + 1]).unwrap();
        drop(writer);

        assert!(!single(server).complete);
    }

    #[test]
    fn test_open_reader_streams_media() {
        let (endpoint, server) =
            serve_once(response("200 OK", "application/gzip", "archive-bytes"));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let mut reader = store.open_reader("bucket", "cargo/v1").unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        reader.close().unwrap();
        assert_eq!(data, b"archive-bytes");

        let request = single(server);
        assert!(
            request
                .head
                .starts_with("GET /storage/v1/b/bucket/o/cargo%2Fv1?alt=media HTTP/1.1"),
            "{}",
            request.head
        );
    }

    #[test]
    fn test_open_reader_not_found() {
        let (endpoint, server) = serve_once(json_response("404 Not Found", "{}"));
        let store = GcsStore::new(&endpoint, None).unwrap();

        let err = store.open_reader("bucket", "missing").err().unwrap();
        assert!(
            matches!(&err, Error::ObjectNotFound { location, key } if location == "bucket" && key == "missing"),
            "{err}"
        );
        server.join().unwrap();
    }

    #[test]
    fn test_list_follows_page_tokens() {
        let first = r#"{"items":[{"name":"npm-2","updated":"2024-03-02T00:00:00Z","size":"2"}],"nextPageToken":"p2"}"#;
        let second = r#"{"items":[{"name":"npm-1","updated":"2024-03-01T00:00:00Z","size":"1"}]}"#;
        let (endpoint, server) = serve(vec![
            json_response("200 OK", first),
            json_response("200 OK", second),
        ]);
        let store = GcsStore::new(&endpoint, None).unwrap();

        let listed = store.list("bucket", "npm-").unwrap();
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["npm-1", "npm-2"]);
        assert_eq!(listed[1].size_bytes, 2);

        let requests = server.join().unwrap();
        assert!(requests[0].head.starts_with("GET /storage/v1/b/bucket/o?prefix=npm- HTTP/1.1"));
        assert!(
            requests[1]
                .head
                .starts_with("GET /storage/v1/b/bucket/o?prefix=npm-&pageToken=p2 HTTP/1.1"),
            "{}",
            requests[1].head
        );
    }
}
