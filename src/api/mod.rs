//! HTTP boundary.
//!
//! A small blocking HTTP/1.1 server: one accept loop on a nonblocking
//! listener, one thread per connection. `/video_feed` connections run a
//! `FramePipeline` on their own thread and write each chunk as soon as it is
//! produced; all other routes are short request/response exchanges against the
//! shared `StreamStateStore`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LockstreamConfig;
use crate::detect::{DetectionAdapter, EngineRegistry, IdMode, Point};
use crate::encode::{JpegFrameEncoder, STREAM_CONTENT_TYPE};
use crate::error::StreamError;
use crate::ingest::{probe_dimensions, SourceSpec};
use crate::pipeline::{CancelToken, FramePipeline};
use crate::select::SelectionOutcome;
use crate::store::StreamStateStore;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_JSON_BODY_BYTES: u64 = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const MSG_LOCKED: &str = "Locked onto object with ID: ";
pub const MSG_ALREADY_LOCKED: &str = "An object is already being tracked. Please reset first.";
pub const MSG_NO_HIT: &str = "No object found at the clicked coordinates.";
pub const MSG_NO_STREAM: &str = "No active stream for this video.";
pub const MSG_RESET: &str = "Selection reset. Ready to track a new object.";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub default_source: String,
    pub engine: String,
    pub id_mode: IdMode,
    pub jpeg_quality: u8,
    pub max_upload_bytes: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&LockstreamConfig::default())
    }
}

impl From<&LockstreamConfig> for ApiConfig {
    fn from(cfg: &LockstreamConfig) -> Self {
        Self {
            addr: cfg.addr.clone(),
            upload_dir: cfg.upload_dir.clone(),
            default_source: cfg.default_source.clone(),
            engine: cfg.detection.engine.clone(),
            id_mode: cfg.detection.id_mode,
            jpeg_quality: cfg.jpeg_quality,
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    streams: Arc<LiveStreams>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Number of `/video_feed` responses currently being written.
    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    /// Stop accepting connections and cancel every live stream.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.streams.cancel_all();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: EngineRegistry,
    store: Arc<StreamStateStore>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: EngineRegistry, store: Arc<StreamStateStore>) -> Self {
        Self {
            cfg,
            registry,
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        SourceSpec::parse(&self.cfg.default_source).context("invalid default video source")?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let streams = Arc::new(LiveStreams::default());
        let shared = Arc::new(Shared {
            cfg: self.cfg,
            registry: self.registry,
            store: self.store,
            streams: Arc::clone(&streams),
            shutdown: Arc::clone(&shutdown),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, shared) {
                log::error!("lockstream api stopped: {}", err);
            }
        });
        log::info!("lockstream api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            streams,
            join: Some(join),
        })
    }
}

struct Shared {
    cfg: ApiConfig,
    registry: EngineRegistry,
    store: Arc<StreamStateStore>,
    streams: Arc<LiveStreams>,
    shutdown: Arc<AtomicBool>,
}

/// Cancel tokens of the `/video_feed` responses in flight.
#[derive(Debug, Default)]
struct LiveStreams {
    next_id: AtomicU64,
    tokens: Mutex<HashMap<u64, CancelToken>>,
}

impl LiveStreams {
    fn register(self: &Arc<Self>) -> LiveTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancelToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        LiveTicket {
            streams: Arc::clone(self),
            id,
            token,
        }
    }

    fn cancel_all(&self) {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        for token in tokens.values() {
            token.cancel();
        }
    }

    fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct LiveTicket {
    streams: Arc<LiveStreams>,
    id: u64,
    token: CancelToken,
}

impl Drop for LiveTicket {
    fn drop(&mut self) {
        self.streams
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn run_api(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &shared) {
                        log::warn!("lockstream api request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let request = match read_request(&mut stream)? {
        Some(request) => request,
        None => {
            write_json(&mut stream, 413, &json!({"error": "request_too_large"}))?;
            return Ok(());
        }
    };
    log::debug!("{} {}", request.method, request.path);

    let expected = match request.path.as_str() {
        "/" | "/health" | "/video_feed" | "/video_info" => "GET",
        "/select_object" | "/reset_selection" | "/upload" => "POST",
        _ => {
            write_json(&mut stream, 404, &json!({"error": "not_found"}))?;
            return Ok(());
        }
    };
    if request.method != expected {
        write_json(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }

    match request.path.as_str() {
        "/" => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        "/health" => write_json(
            &mut stream,
            200,
            &json!({"status": "ok", "active_streams": shared.store.len()}),
        ),
        "/upload" => handle_upload(&mut stream, &request, shared),
        path => {
            let spec = match resolve_source(&shared.cfg, request.query.get("video").map(String::as_str)) {
                Ok(spec) => spec,
                Err(err) => {
                    log::warn!("rejected video parameter: {:#}", err);
                    write_json(&mut stream, 400, &json!({"error": "invalid_video"}))?;
                    return Ok(());
                }
            };
            match path {
                "/video_feed" => serve_video_feed(stream, shared, spec),
                "/video_info" => serve_video_info(&mut stream, spec),
                "/select_object" => handle_select(&mut stream, &request, shared, &spec),
                _ => {
                    shared.store.reset(&spec.to_string());
                    write_json(&mut stream, 200, &json!({"success": true, "message": MSG_RESET}))
                }
            }
        }
    }
}

/// Resolve the `video` query parameter to a source. Names refer to files in
/// the upload directory; `stub://` descriptions are passed through.
fn resolve_source(cfg: &ApiConfig, video: Option<&str>) -> Result<SourceSpec> {
    let video = match video.map(str::trim).filter(|v| !v.is_empty()) {
        Some(video) => video,
        None => return SourceSpec::parse(&cfg.default_source),
    };
    if video.starts_with("stub://") {
        return SourceSpec::parse(video);
    }
    let name = secure_filename(video);
    if name.is_empty() {
        return Err(anyhow!("video name '{}' has no usable characters", video));
    }
    Ok(SourceSpec::Path(cfg.upload_dir.join(name)))
}

fn serve_video_feed(mut stream: TcpStream, shared: &Shared, spec: SourceSpec) -> Result<()> {
    let engine = match shared.registry.create(&shared.cfg.engine) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("engine '{}' unavailable: {:#}", shared.cfg.engine, err);
            write_json(&mut stream, 500, &json!({"error": "engine_unavailable"}))?;
            return Ok(());
        }
    };
    let ticket = shared.streams.register();
    if shared.shutdown.load(Ordering::SeqCst) {
        ticket.token.cancel();
    }
    let mut pipeline = FramePipeline::for_source(
        spec,
        DetectionAdapter::new(engine, shared.cfg.id_mode),
        Box::new(JpegFrameEncoder::new(shared.cfg.jpeg_quality)),
        Arc::clone(&shared.store),
    )
    .with_cancel_token(ticket.token.clone());

    let first = match pipeline.next() {
        Some(chunk) => chunk,
        None => {
            write_json(&mut stream, 404, &json!({"error": "video_unavailable"}))?;
            return Ok(());
        }
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&first)?;
    for chunk in pipeline.by_ref() {
        if let Err(err) = stream.write_all(&chunk) {
            log::info!("stream {}: consumer left ({})", pipeline.stream_key(), err);
            break;
        }
    }
    Ok(())
}

fn serve_video_info(stream: &mut TcpStream, spec: SourceSpec) -> Result<()> {
    match probe_dimensions(&spec) {
        Ok((width, height)) => write_json(
            stream,
            200,
            &json!({"video": spec.to_string(), "width": width, "height": height}),
        ),
        Err(err) => {
            log::warn!("video info for {} unavailable: {:#}", spec, err);
            write_json(stream, 404, &json!({"error": "video_unavailable"}))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    x: f32,
    y: f32,
}

fn handle_select(
    stream: &mut TcpStream,
    request: &HttpRequest,
    shared: &Shared,
    spec: &SourceSpec,
) -> Result<()> {
    let body = match read_body(stream, request, MAX_JSON_BODY_BYTES)? {
        Some(body) => body,
        None => return write_json(stream, 413, &json!({"error": "request_too_large"})),
    };
    let parsed = serde_json::from_slice::<SelectRequest>(&body)
        .map_err(|e| StreamError::InvalidSelectionRequest(e.to_string()))
        .and_then(|req| shared.store.try_select(&spec.to_string(), Point::new(req.x, req.y)));
    match parsed {
        Ok(outcome) => {
            log::info!("selection on {}: {:?}", spec, outcome);
            write_json(stream, 200, &selection_response(outcome))
        }
        Err(StreamError::UnknownStream(_)) => {
            write_json(stream, 200, &json!({"success": false, "message": MSG_NO_STREAM}))
        }
        Err(err) => {
            log::warn!("selection on {} rejected: {} [{}]", spec, err, err.kind());
            write_json(
                stream,
                400,
                &json!({"error": err.kind(), "message": err.to_string()}),
            )
        }
    }
}

/// JSON body for a resolved selection.
pub fn selection_response(outcome: SelectionOutcome) -> Value {
    match outcome {
        SelectionOutcome::Selected { id } => json!({
            "success": true,
            "selected_id": id,
            "message": format!("{}{}", MSG_LOCKED, id),
        }),
        SelectionOutcome::AlreadyLocked { selected_id } => json!({
            "success": false,
            "selected_id": selected_id,
            "message": MSG_ALREADY_LOCKED,
        }),
        SelectionOutcome::NoHit => json!({"success": false, "message": MSG_NO_HIT}),
    }
}

fn handle_upload(stream: &mut TcpStream, request: &HttpRequest, shared: &Shared) -> Result<()> {
    let name = secure_filename(request.query.get("filename").map(String::as_str).unwrap_or(""));
    if name.is_empty() {
        return write_json(stream, 400, &json!({"error": "invalid_filename"}));
    }
    let length = request.content_length()?.unwrap_or(0);
    if length == 0 {
        return write_json(stream, 400, &json!({"error": "empty_upload"}));
    }
    if length > shared.cfg.max_upload_bytes {
        return write_json(stream, 413, &json!({"error": "upload_too_large"}));
    }

    std::fs::create_dir_all(&shared.cfg.upload_dir).with_context(|| {
        format!(
            "failed to create upload dir {}",
            shared.cfg.upload_dir.display()
        )
    })?;
    let path = shared.cfg.upload_dir.join(&name);
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let prefix_len = request.body_prefix.len().min(length as usize);
    file.write_all(&request.body_prefix[..prefix_len])?;
    let copied = std::io::copy(&mut (&mut *stream).take(length - prefix_len as u64), &mut file)?;
    if prefix_len as u64 + copied != length {
        drop(file);
        let _ = std::fs::remove_file(&path);
        return Err(anyhow!(
            "upload {} truncated: expected {} bytes, got {}",
            name,
            length,
            prefix_len as u64 + copied
        ));
    }
    log::info!("stored upload {} ({} bytes)", path.display(), length);
    write_json(stream, 200, &json!({"success": true, "video": name}))
}

/// Reduce a client-supplied name to a safe single path component.
pub fn secure_filename(name: &str) -> String {
    static UNSAFE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UNSAFE_RE.get_or_init(|| regex::Regex::new(r"[^A-Za-z0-9_.-]").unwrap());
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let joined = base.split_whitespace().collect::<Vec<_>>().join("_");
    re.replace_all(&joined, "")
        .trim_start_matches(['.', '_'])
        .to_string()
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    /// Body bytes that arrived together with the headers.
    body_prefix: Vec<u8>,
}

impl HttpRequest {
    fn content_length(&self) -> Result<Option<u64>> {
        match self.headers.get("content-length") {
            Some(value) => Ok(Some(
                value
                    .parse()
                    .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
            )),
            None => Ok(None),
        }
    }
}

/// Read the request line and headers. `Ok(None)` when the header block is too large.
fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    let body_prefix = data[header_end + 4..].to_vec();
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body_prefix,
    }))
}

/// Read a `Content-Length` body of at most `limit` bytes. `Ok(None)` when larger.
fn read_body(stream: &mut TcpStream, request: &HttpRequest, limit: u64) -> Result<Option<Vec<u8>>> {
    let length = request.content_length()?.unwrap_or(0);
    if length > limit {
        return Ok(None);
    }
    let mut body = request.body_prefix.clone();
    body.truncate(length as usize);
    let remaining = length - body.len() as u64;
    (&mut *stream).take(remaining).read_to_end(&mut body)?;
    if body.len() as u64 != length {
        return Err(anyhow!(
            "request body truncated: expected {} bytes, got {}",
            length,
            body.len()
        ));
    }
    Ok(Some(body))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if k.is_empty() {
                None
            } else {
                Some((percent_decode(k), percent_decode(v)))
            }
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()));
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>lockstream</title></head>
<body>
<img id="feed" alt="video feed">
<p><button id="reset">Reset selection</button> <span id="status"></span></p>
<script>
const qs = window.location.search;
const feed = document.getElementById("feed");
const status = document.getElementById("status");
feed.src = "/video_feed" + qs;
feed.addEventListener("click", async (ev) => {
  const rect = feed.getBoundingClientRect();
  const x = (ev.clientX - rect.left) * feed.naturalWidth / rect.width;
  const y = (ev.clientY - rect.top) * feed.naturalHeight / rect.height;
  const res = await fetch("/select_object" + qs, {
    method: "POST",
    headers: {"Content-Type": "application/json"},
    body: JSON.stringify({x, y}),
  });
  status.textContent = (await res.json()).message || "";
});
document.getElementById("reset").addEventListener("click", async () => {
  const res = await fetch("/reset_selection" + qs, {method: "POST"});
  status.textContent = (await res.json()).message;
});
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(secure_filename("clip.mp4"), "clip.mp4");
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("my holiday video.mp4"), "my_holiday_video.mp4");
        assert_eq!(secure_filename("..\\win\\evil.avi"), "evil.avi");
        assert_eq!(secure_filename(".hidden"), "hidden");
        assert_eq!(secure_filename("../.."), "");
        assert_eq!(secure_filename("ünïcode?.mp4"), "ncode.mp4");
    }

    #[test]
    fn resolves_video_parameter() {
        let cfg = ApiConfig {
            upload_dir: PathBuf::from("/srv/uploads"),
            ..ApiConfig::default()
        };
        assert_eq!(resolve_source(&cfg, None).unwrap().to_string(), "stub://demo");
        assert_eq!(resolve_source(&cfg, Some("  ")).unwrap().to_string(), "stub://demo");
        assert_eq!(
            resolve_source(&cfg, Some("../clip.mp4")).unwrap(),
            SourceSpec::Path(PathBuf::from("/srv/uploads/clip.mp4"))
        );
        assert_eq!(
            resolve_source(&cfg, Some("stub://other?frames=2")).unwrap().to_string(),
            "stub://other"
        );
        assert!(resolve_source(&cfg, Some("///")).is_err());
        assert!(resolve_source(&cfg, Some("stub://huge?width=60000&height=60000")).is_err());
    }

    #[test]
    fn decodes_query_strings() {
        let query = parse_query("video=my%20clip.mp4&x=a+b&flag&=skip&bad=%zz");
        assert_eq!(query.get("video").unwrap(), "my clip.mp4");
        assert_eq!(query.get("x").unwrap(), "a b");
        assert_eq!(query.get("flag").unwrap(), "");
        assert_eq!(query.get("bad").unwrap(), "%zz");
        assert_eq!(query.len(), 4);
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%+5x"), "% 5x");
        assert_eq!(percent_decode("%-1"), "%-1");
    }

    #[test]
    fn selection_bodies() {
        assert_eq!(
            selection_response(SelectionOutcome::Selected { id: 7 }),
            json!({"success": true, "selected_id": 7, "message": "Locked onto object with ID: 7"})
        );
        assert_eq!(
            selection_response(SelectionOutcome::AlreadyLocked { selected_id: 3 }),
            json!({"success": false, "selected_id": 3, "message": MSG_ALREADY_LOCKED})
        );
        assert_eq!(
            selection_response(SelectionOutcome::NoHit),
            json!({"success": false, "message": MSG_NO_HIT})
        );
    }
}
