use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use mber_sync_core::client::MberClient;
use mber_sync_core::contract::{
    DownloadBody, Method, MockTransport, RemoteCall, Request, Transport, UploadBody,
};
use mber_sync_core::envelope::Status;
use mber_sync_core::error::{MberError, MberResult};
use mber_sync_core::session::SessionState;
use mber_sync_core::transfer::Progress;

const DIR_ID: &str = "DirDirDirDirDirDirDir1";
const DOWNLOAD_URL: &str =
    "https://mber.example/service/raw/data/download/'report.txt?access_token=tok";

fn reply(request: &Request, body: Value) -> RemoteCall {
    RemoteCall {
        method: request.method,
        url: request.url.clone(),
        status: 200,
        body: body.to_string(),
    }
}

fn slot_reply(url: &str, body: &str) -> RemoteCall {
    RemoteCall {
        method: Method::Put,
        url: url.to_string(),
        status: 200,
        body: body.to_string(),
    }
}

fn logged_in() -> SessionState {
    let mut state = SessionState::new("https://mber.example/", "my-app");
    state.access_token = "tok".into();
    state.application_id = "AppIdAppIdAppIdAppId01".into();
    state
}

fn body_of(chunks: Vec<Vec<u8>>, declared: Option<u64>) -> DownloadBody {
    let chunks: Vec<std::io::Result<Bytes>> = chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
    DownloadBody {
        content_length: declared,
        stream: Box::pin(futures::stream::iter(chunks)),
    }
}

fn recorder() -> (Arc<Mutex<Vec<u8>>>, Progress) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let listener: Progress = Arc::new(move |p: u8| captured.lock().push(p));
    (seen, listener)
}

#[tokio::test]
async fn test_short_download_reports_missing_bytes_and_removes_file() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    let mut transport = MockTransport::new();
    transport.expect_redirect_target().returning(|_| Ok(None));
    transport
        .expect_open()
        .times(1)
        .returning(|_| Ok(body_of(vec![vec![1u8; 500], vec![2u8; 300]], Some(1000))));

    let client = MberClient::new(transport, logged_in());
    let response = client.download(&dest, "report.txt", None).await;

    assert_eq!(response.status, Status::Failed);
    assert_eq!(response.error_message(), "Missing 200 bytes in out.bin");
    assert!(!dest.exists(), "partial download must not be left behind");
}

#[tokio::test]
async fn test_download_follows_redirects_and_reports_progress() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("report.txt");

    let mut transport = MockTransport::new();
    transport
        .expect_redirect_target()
        .withf(|url| url.contains("/service/raw/data/download/"))
        .times(1)
        .returning(|url| {
            assert_eq!(url, DOWNLOAD_URL);
            Ok(Some("https://cdn.example/blob/1".to_string()))
        });
    transport
        .expect_redirect_target()
        .withf(|url| url.contains("cdn.example"))
        .times(1)
        .returning(|_| Ok(None));
    transport
        .expect_open()
        .withf(|url| url.contains("https://cdn.example/blob/1"))
        .times(1)
        .returning(|_| {
            Ok(body_of(
                vec![vec![b'a'; 250], vec![b'b'; 250], vec![b'c'; 500]],
                Some(1000),
            ))
        });

    let (seen, listener) = recorder();
    let client = MberClient::new(transport, logged_in());
    let response = client.download(&dest, "report.txt", Some(listener)).await;

    assert!(response.is_success(), "download should succeed: {response}");
    assert_eq!(response.payload["bytes"], json!(1000));
    assert_eq!(std::fs::read(&dest).unwrap().len(), 1000);
    assert_eq!(*seen.lock(), vec![25, 50, 100]);
}

#[tokio::test]
async fn test_download_without_declared_length_is_accepted() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("stream.log");

    let mut transport = MockTransport::new();
    transport.expect_redirect_target().returning(|_| Ok(None));
    transport
        .expect_open()
        .returning(|_| Ok(body_of(vec![b"hello ".to_vec(), b"world".to_vec()], None)));

    let client = MberClient::new(transport, logged_in());
    let response = client.download(&dest, "stream.log", None).await;
    assert!(response.is_success());
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello world");
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("never.bin");

    let mut transport = MockTransport::new();
    transport
        .expect_redirect_target()
        .times(11)
        .returning(|url| Ok(Some(format!("{url}/again"))));

    let client = MberClient::new(transport, logged_in());
    let response = client.download(&dest, "report.txt", None).await;

    assert!(response.is_failed());
    assert!(
        response.error_message().starts_with("Too many redirects"),
        "unexpected error: {}",
        response.error_message()
    );
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_failed_open_leaves_existing_file_alone() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("keep.txt");
    std::fs::write(&dest, "original").unwrap();

    let mut transport = MockTransport::new();
    transport.expect_redirect_target().returning(|_| Ok(None));
    transport
        .expect_open()
        .returning(|_| Err(MberError::Network("connection reset".into())));

    let client = MberClient::new(transport, logged_in());
    let response = client.download(&dest, "keep.txt", None).await;

    assert_eq!(response.error_message(), "connection reset");
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "original");
}

#[tokio::test]
async fn test_cancelled_download_is_aborted() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("slow.bin");

    let mut transport = MockTransport::new();
    transport.expect_redirect_target().returning(|_| Ok(None));
    transport.expect_open().returning(|_| {
        Ok(DownloadBody {
            content_length: Some(10),
            stream: Box::pin(futures::stream::pending::<std::io::Result<Bytes>>()),
        })
    });

    let cancel = CancellationToken::new();
    cancel.cancel();
    let client = MberClient::new(transport, logged_in()).with_cancellation(cancel);
    let response = client.download(&dest, "slow.bin", None).await;

    assert!(response.is_aborted());
    assert_eq!(response.error_message(), "Aborted by user");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_upload_streams_file_to_slot() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, vec![0u8; 42]).unwrap();

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|r| r.method == Method::Post && r.url.ends_with("/service/json/data/upload/"))
        .times(1)
        .returning(|r| {
            let body = r.json.clone().unwrap_or_default();
            assert_eq!(body["name"], "app.zip");
            assert_eq!(body["size"], 42);
            assert_eq!(body["directoryId"], DIR_ID);
            assert_eq!(body["tags"], json!(["nightly", "app.zip"]));
            assert!(body["transactionId"].is_string());
            Ok(reply(&r, json!({"status": "Success", "url": "https://blob.example/slot/1"})))
        });
    transport
        .expect_put_stream()
        .withf(|url, body| url.contains("https://blob.example/slot/1") && body.length == 42)
        .times(1)
        .returning(|url, _| Ok(slot_reply(url, "")));

    let client = MberClient::new(transport, logged_in());
    let tags = vec!["nightly".to_string(), "app.zip".to_string()];
    let response = client
        .upload(&file, DIR_ID, "app.zip", &tags, false, None)
        .await;

    assert!(response.is_success(), "upload should succeed: {response}");
    assert_eq!(response.get_str("url"), Some("https://blob.example/slot/1"));
    assert_eq!(client.ledger().len("my-app"), 2);
}

#[tokio::test]
async fn test_upload_with_non_empty_slot_body_fails() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, b"zip").unwrap();

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .returning(|r| Ok(reply(&r, json!({"status": "Success", "url": "https://blob.example/slot/2"}))));
    transport
        .expect_put_stream()
        .returning(|url, _| Ok(slot_reply(url, "<Error>SignatureDoesNotMatch</Error>")));

    let client = MberClient::new(transport, logged_in());
    let response = client.upload(&file, DIR_ID, "app.zip", &[], false, None).await;

    assert!(response.is_failed());
    assert_eq!(response.error_message(), "<Error>SignatureDoesNotMatch</Error>");
}

#[tokio::test]
async fn test_duplicate_upload_with_overwrite_reuses_existing_document() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, b"zip").unwrap();

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|r| r.method == Method::Post)
        .times(1)
        .returning(|r| Ok(reply(&r, json!({"status": "Duplicate", "error": "exists"}))));
    transport
        .expect_send()
        .withf(|r| r.method == Method::Get)
        .times(1)
        .returning(|r| {
            Ok(reply(
                &r,
                json!({"status": "Success", "result": {"documents": [
                    {"name": "other.zip", "documentId": "doc-1"},
                    {"name": "app.zip", "documentId": "doc-3"}
                ]}}),
            ))
        });
    transport
        .expect_send()
        .withf(|r| r.method == Method::Put)
        .times(1)
        .returning(|r| {
            assert_eq!(r.url, "https://mber.example/service/json/data/upload/doc-3");
            Ok(reply(&r, json!({"status": "Success", "url": "https://blob.example/slot/3"})))
        });
    transport
        .expect_put_stream()
        .withf(|url, _| url.contains("slot/3"))
        .times(1)
        .returning(|url, _| Ok(slot_reply(url, "")));

    let client = MberClient::new(transport, logged_in());
    let response = client.upload(&file, DIR_ID, "app.zip", &[], true, None).await;
    assert!(response.is_success(), "{response}");
}

#[tokio::test]
async fn test_duplicate_upload_without_listed_entry_fails() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, b"zip").unwrap();

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|r| r.method == Method::Post)
        .returning(|r| Ok(reply(&r, json!({"status": "Duplicate"}))));
    transport
        .expect_send()
        .withf(|r| r.method == Method::Get)
        .returning(|r| Ok(reply(&r, json!({"status": "Success", "result": {"documents": []}}))));

    let client = MberClient::new(transport, logged_in());
    let response = client.upload(&file, DIR_ID, "app.zip", &[], true, None).await;
    assert_eq!(
        response.error_message(),
        format!("Duplicate reported but no matching entry found: app.zip in directory {DIR_ID}")
    );
}

#[tokio::test]
async fn test_upload_of_missing_file_never_asks_for_a_slot() {
    let client = MberClient::new(MockTransport::new(), logged_in());
    let response = client
        .upload(std::path::Path::new("/nonexistent/app.zip"), DIR_ID, "app.zip", &[], false, None)
        .await;
    assert!(response.is_failed());
}

#[tokio::test]
async fn test_upload_json_sends_base64_content() {
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|r| r.url.ends_with("/service/json/data/document/"))
        .times(1)
        .returning(|r| {
            let body = r.json.clone().unwrap_or_default();
            let decoded = STANDARD.decode(body["content"].as_str().unwrap()).unwrap();
            let content: Value = serde_json::from_slice(&decoded).unwrap();
            assert_eq!(content, json!({"failCount": 0, "totalCount": 3}));
            assert_eq!(body["name"], "tests.json");
            Ok(reply(&r, json!({"status": "Success", "documentId": "doc-t"})))
        });

    let client = MberClient::new(transport, logged_in());
    let response = client
        .upload_json(
            &json!({"failCount": 0, "totalCount": 3}),
            DIR_ID,
            "tests.json",
            &["tests.json".to_string()],
        )
        .await;
    assert!(response.is_success());
}

/// Grants an upload slot, then never finishes the byte transfer.
struct StalledSlot;

#[async_trait::async_trait]
impl Transport for StalledSlot {
    async fn send(&self, request: Request) -> MberResult<RemoteCall> {
        Ok(reply(
            &request,
            json!({"status": "Success", "url": "https://blob.example/slot/9"}),
        ))
    }

    async fn put_stream(&self, _url: &str, _body: UploadBody) -> MberResult<RemoteCall> {
        futures::future::pending().await
    }

    async fn redirect_target(&self, _url: &str) -> MberResult<Option<String>> {
        Ok(None)
    }

    async fn open(&self, url: &str) -> MberResult<DownloadBody> {
        Err(MberError::Network(format!("unexpected download of {url}")))
    }
}

#[tokio::test]
async fn test_cancelled_upload_is_aborted() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, vec![0u8; 64]).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let client = MberClient::new(StalledSlot, logged_in()).with_cancellation(cancel);
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.upload(&file, DIR_ID, "app.zip", &[], false, None),
    )
    .await
    .expect("cancellation should end the stalled upload");

    assert_eq!(response.status, Status::Aborted);
    assert_eq!(response.error_message(), "Aborted by user");
}
