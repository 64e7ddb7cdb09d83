use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pole_overlay_core::api::{ApiClient, ApiError, CancelFlag, ProgressFn, TaskId};
use pole_overlay_core::cache::DetectionCache;
use pole_overlay_core::history::{MemoryStorage, Outcome, UploadHistory};

/// Canned backend: one thread, one request per connection.
struct MockBackend {
    base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
    uploaded_bytes: Arc<AtomicUsize>,
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        let lower = header.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().ok()?;
        }
        if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
            chunked = true;
        }
    }

    let mut body = Vec::new();
    if chunked {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).ok()?;
            let size = usize::from_str_radix(size.trim(), 16).ok()?;
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).ok()?;
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    } else {
        body.resize(content_length, 0);
        reader.read_exact(&mut body).ok()?;
    }
    Some(Request { method, path, body })
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

const DETECTIONS: &str = r#"{"success": true, "data": [
    {"frame_index": 45, "time": 1.5, "boxes": [
        {"id": 1, "xyxy": [100, 150, 250, 500], "label": "iron_pole", "confidence": 0.93}
    ]}
]}"#;

impl MockBackend {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let uploaded_bytes = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&hits);
        let uploaded = Arc::clone(&uploaded_bytes);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let Some(req) = read_request(&mut stream) else { continue };
                log.lock().unwrap().push(format!("{} {}", req.method, req.path));
                match (req.method.as_str(), req.path.as_str()) {
                    ("GET", "/") => respond(
                        &mut stream,
                        "200 OK",
                        "application/json",
                        br#"{"message": "Railway Pole Detection API", "version": "1.0.0", "status": "running"}"#,
                    ),
                    ("POST", "/upload") => {
                        uploaded.store(req.body.len(), Ordering::SeqCst);
                        respond(
                            &mut stream,
                            "200 OK",
                            "application/json",
                            br#"{"success": true, "data": {"task_id": "local_9f8e7d", "fps": 30.0, "width": 1920, "height": 1080}}"#,
                        )
                    }
                    ("POST", "/detect/local_abc123") => respond(
                        &mut stream,
                        "200 OK",
                        "application/json",
                        br#"{"success": true, "data": {"generated": false, "already_exists": true, "task_id": "local_abc123"}}"#,
                    ),
                    ("GET", "/detections/local_abc123") => {
                        respond(&mut stream, "200 OK", "application/json", DETECTIONS.as_bytes())
                    }
                    ("GET", "/history") => respond(
                        &mut stream,
                        "200 OK",
                        "application/json",
                        br#"{"success": true, "data": [{"task_id": "local_abc123", "created_at": "2025-11-19T10:15:30.123456"}]}"#,
                    ),
                    ("GET", "/videos/local_abc123") => {
                        respond(&mut stream, "200 OK", "video/mp4", b"\x00\x00\x00\x18ftypmp42")
                    }
                    ("GET", "/videos/local_trunc1") => {
                        // Promise far more than is sent, then hang up.
                        let head = "HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: 100000\r\nConnection: close\r\n\r\n";
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(&[0u8; 10]);
                        let _ = stream.flush();
                    }
                    ("GET", "/broken") | ("POST", "/detect/local_broken") => {
                        respond(&mut stream, "500 Internal Server Error", "text/plain", b"oops")
                    }
                    _ => respond(
                        &mut stream,
                        "404 Not Found",
                        "application/json",
                        br#"{"success": false, "error": "TASK_NOT_FOUND"}"#,
                    ),
                }
            }
        });

        Self {
            base_url,
            hits,
            uploaded_bytes,
        }
    }

    fn client(&self) -> ApiClient {
        ApiClient::new(&self.base_url, Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    fn count(&self, request: &str) -> usize {
        self.hits.lock().unwrap().iter().filter(|r| *r == request).count()
    }
}

fn task(raw: &str) -> TaskId {
    TaskId::parse(raw).unwrap()
}

#[test]
fn test_health_is_not_enveloped() {
    let backend = MockBackend::start();
    let health = backend.client().health().unwrap();
    assert_eq!(health.status, "running");
    assert_eq!(health.version, "1.0.0");
}

#[test]
fn test_detect_then_fetch() {
    let backend = MockBackend::start();
    let client = backend.client();

    let outcome = client.trigger_detection(&task("local_abc123")).unwrap();
    assert!(!outcome.generated);
    assert!(outcome.already_exists);

    let set = client.detections(&task("local_abc123")).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set[0].frame_index, 45);
    assert_eq!(set[0].boxes[0].confidence, Some(0.93));
}

#[test]
fn test_cached_detections_fetch_once() {
    let backend = MockBackend::start();
    let client = backend.client();
    let mut cache = DetectionCache::new(4);

    let first = client.cached_detections(&mut cache, &task("local_abc123")).unwrap();
    let second = client.cached_detections(&mut cache, &task("local_abc123")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(backend.count("GET /detections/local_abc123"), 1);
}

#[test]
fn test_backend_errors_surface_their_code() {
    let backend = MockBackend::start();
    let client = backend.client();

    let err = client.detections(&task("local_000000")).unwrap_err();
    assert!(matches!(&err, ApiError::Backend { code } if code == "TASK_NOT_FOUND"));

    // Non-JSON error bodies fall back to the HTTP status.
    let err = client.trigger_detection(&task("local_broken")).unwrap_err();
    assert!(matches!(&err, ApiError::Backend { code } if code == "HTTP_500"), "{err:?}");
}

#[test]
fn test_history_and_video_download() {
    let backend = MockBackend::start();
    let client = backend.client();

    let entries = client.history().unwrap();
    assert_eq!(entries[0].task_id, "local_abc123");
    assert!(entries[0].created_at().is_some());

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("video.mp4");
    let bytes = client.download_video(&task("local_abc123"), &dest).unwrap();
    assert_eq!(bytes, 12);
    assert_eq!(std::fs::read(&dest).unwrap().len(), 12);
    assert!(!dir.path().join("video.mp4.part").exists());

    let err = client
        .download_video(&task("local_000000"), &dir.path().join("missing.mp4"))
        .unwrap_err();
    assert!(matches!(err, ApiError::Backend { .. }));
}

#[test]
fn test_interrupted_download_leaves_no_file() {
    let backend = MockBackend::start();
    let client = backend.client();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("cut.mp4");

    let err = client.download_video(&task("local_trunc1"), &dest).unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
    assert!(!dest.exists());
    assert!(!dir.path().join("cut.mp4.part").exists());
}

#[test]
fn test_upload_reports_progress_and_is_logged() {
    let backend = MockBackend::start();
    let client = backend.client();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("line-7.mp4");
    std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();

    let last = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&last);
    let progress: ProgressFn =
        Box::new(move |sent: u64, _total: u64| sink.store(sent as usize, Ordering::SeqCst));
    let receipt = client.upload(&path, Some(progress), &CancelFlag::new()).unwrap();

    assert_eq!(receipt.task_id.as_str(), "local_9f8e7d");
    assert_eq!(last.load(Ordering::SeqCst), 64 * 1024);
    // Multipart framing wraps the file bytes.
    assert!(backend.uploaded_bytes.load(Ordering::SeqCst) > 64 * 1024);

    let mut history = UploadHistory::open(MemoryStorage::new(), 20);
    history.record_success("line-7.mp4", 64 * 1024, &receipt);
    let record = &history.records()[0];
    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.task_id.as_deref(), Some("local_9f8e7d"));
}

#[test]
fn test_unreachable_backend_is_a_retryable_network_error() {
    // Bind then drop so the port is very likely closed.
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let client = ApiClient::new(
        &format!("http://127.0.0.1:{port}"),
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .unwrap();
    let err = client.history().unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}
