//! HttpDownloader against a local server with and without range support.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header::RANGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ota_updater::{
    CancelFlag, DownloadRequest, Downloader, HttpDownloader, ResponseInfo, TransferError,
    TransferListener,
};
use tempfile::TempDir;

fn blob() -> Vec<u8> {
    (0..50_000u32).map(|i| (i % 253) as u8).collect()
}

async fn ranged(State(blob): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
    let start = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

    match start {
        Some(start) if start >= blob.len() => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        Some(start) => (StatusCode::PARTIAL_CONTENT, blob[start..].to_vec()).into_response(),
        None => blob.to_vec().into_response(),
    }
}

async fn whole(State(blob): State<Arc<Vec<u8>>>) -> Response {
    blob.to_vec().into_response()
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/ranged.zip", get(ranged))
        .route("/whole.zip", get(whole))
        .with_state(Arc::new(blob()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Default)]
struct Recorder {
    response: Mutex<Option<ResponseInfo>>,
    progress: Mutex<Vec<(u64, u64)>>,
}

impl TransferListener for Recorder {
    fn on_response(&self, info: ResponseInfo) {
        *self.response.lock().unwrap() = Some(info);
    }

    fn on_progress(&self, done: u64, total: u64) {
        self.progress.lock().unwrap().push((done, total));
    }
}

fn request(addr: SocketAddr, path: &str, destination: std::path::PathBuf, offset: u64) -> DownloadRequest {
    DownloadRequest {
        download_id: "a".to_string(),
        url: format!("http://{}{}", addr, path),
        destination,
        offset,
        expected_size: blob().len() as u64,
    }
}

#[tokio::test]
async fn test_full_download() {
    let addr = serve().await;
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("nested/a.zip");

    let recorder = Recorder::default();
    HttpDownloader::new()
        .unwrap()
        .download(request(addr, "/ranged.zip", destination.clone(), 0), &recorder, CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), blob());
    let response = recorder.response.lock().unwrap().clone().unwrap();
    assert_eq!(response.status_code, 200);
    assert!(!response.resumed);

    let progress = recorder.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(progress.last(), Some(&(50_000, 50_000)));
}

#[tokio::test]
async fn test_resume_appends_to_partial_file() {
    let addr = serve().await;
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("a.zip");
    std::fs::write(&destination, &blob()[..20_000]).unwrap();

    let recorder = Recorder::default();
    HttpDownloader::new()
        .unwrap()
        .download(request(addr, "/ranged.zip", destination.clone(), 20_000), &recorder, CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), blob());
    let response = recorder.response.lock().unwrap().clone().unwrap();
    assert_eq!(response.status_code, 206);
    assert!(response.resumed);
    assert!(recorder.progress.lock().unwrap()[0].0 > 20_000);
}

#[tokio::test]
async fn test_ignored_range_restarts_from_zero() {
    let addr = serve().await;
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("a.zip");
    std::fs::write(&destination, vec![0xffu8; 20_000]).unwrap();

    let recorder = Recorder::default();
    HttpDownloader::new()
        .unwrap()
        .download(request(addr, "/whole.zip", destination.clone(), 20_000), &recorder, CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), blob());
    assert!(!recorder.response.lock().unwrap().clone().unwrap().resumed);
}

#[tokio::test]
async fn test_complete_partial_file_is_accepted() {
    let addr = serve().await;
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("a.zip");
    std::fs::write(&destination, blob()).unwrap();

    let recorder = Recorder::default();
    HttpDownloader::new()
        .unwrap()
        .download(request(addr, "/ranged.zip", destination.clone(), 50_000), &recorder, CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), blob());
}

#[tokio::test]
async fn test_cancelled_and_failed_transfers() {
    let addr = serve().await;
    let dir = TempDir::new().unwrap();
    let downloader = HttpDownloader::new().unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let result = downloader
        .download(request(addr, "/ranged.zip", dir.path().join("a.zip"), 0), &Recorder::default(), cancel)
        .await;
    assert_eq!(result, Err(TransferError::Cancelled));

    let result = downloader
        .download(request(addr, "/missing.zip", dir.path().join("b.zip"), 0), &Recorder::default(), CancelFlag::new())
        .await;
    assert!(matches!(result, Err(TransferError::Failed(_))));
}
