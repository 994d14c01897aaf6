mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use sha2::{Digest, Sha256};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{FakeClient, drain, params, record, session};
use launchkit::{
    DownloadJob, Error, HttpWorker, JobDeps, JobState, Manifest, ManifestFile,
    MemoryCredentialStore, PathLocks, SessionManager, StatusChannel, StatusEvent,
};

fn entry(path: &str, size: u64, sha256: Option<String>) -> ManifestFile {
    ManifestFile {
        path: path.into(),
        size,
        sha256,
        url: None,
    }
}

fn digest(body: &[u8]) -> Option<String> {
    Some(format!("{:x}", Sha256::digest(body)))
}

fn listing(server: &MockServer, files: Vec<ManifestFile>) -> Manifest {
    Manifest {
        app_name: "Sugar".into(),
        build_version: "2.0.0".into(),
        base_url: Some(format!("{}/sugar", server.uri())),
        files,
    }
}

async fn serve(server: &MockServer, file: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/sugar/{file}")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn http_deps(client: Arc<FakeClient>, locks: &PathLocks) -> JobDeps {
    JobDeps::new(
        client,
        Arc::new(HttpWorker::new(Duration::from_secs(5))),
        locks.clone(),
    )
}

async fn started_job(destination: &Path, deps: JobDeps) -> (DownloadJob, StatusChannel) {
    let mut job =
        DownloadJob::create(session(TimeDelta::hours(1)), params(destination), deps).unwrap();
    job.analyze().await.unwrap();
    let status = job.start().unwrap();
    (job, status)
}

fn no_partials_under(dir: &Path) -> bool {
    fn walk(dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return true;
        };
        entries.flatten().all(|entry| {
            let path = entry.path();
            if path.is_dir() {
                walk(&path)
            } else {
                path.extension().is_none_or(|ext| ext != "part")
            }
        })
    }
    walk(dir)
}

#[tokio::test]
async fn downloads_land_under_their_final_names() {
    let server = MockServer::start().await;
    serve(
        &server,
        "Content/a.pak",
        ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()),
    )
    .await;
    serve(
        &server,
        "Content/b.pak",
        ResponseTemplate::new(200).set_body_bytes(b"bravo!".to_vec()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("Sugar");
    let client = Arc::new(FakeClient::new());
    client.set_manifest(Ok(listing(
        &server,
        vec![
            entry("Content/a.pak", 5, digest(b"alpha")),
            entry("Content/b.pak", 6, digest(b"bravo!")),
        ],
    )));
    let locks = PathLocks::new();

    let (mut job, mut status) = started_job(&destination, http_deps(client, &locks)).await;
    let events = drain(&mut status).await;

    assert_eq!(job.wait().await, JobState::Completed);
    assert_eq!(events.last(), Some(&StatusEvent::Completed));
    assert_eq!(
        std::fs::read(destination.join("Content/a.pak")).unwrap(),
        b"alpha"
    );
    assert_eq!(
        std::fs::read(destination.join("Content/b.pak")).unwrap(),
        b"bravo!"
    );
    assert!(no_partials_under(&destination));
    assert!(!locks.is_held(&destination));
}

#[tokio::test]
async fn short_body_fails_and_leaves_nothing_behind() {
    let server = MockServer::start().await;
    serve(
        &server,
        "Content/a.pak",
        ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("Sugar");
    let client = Arc::new(FakeClient::new());
    client.set_manifest(Ok(listing(&server, vec![entry("Content/a.pak", 10, None)])));

    let (mut job, mut status) =
        started_job(&destination, http_deps(client, &PathLocks::new())).await;
    let events = drain(&mut status).await;

    assert_eq!(job.wait().await, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(StatusEvent::Failed {
            error: Error::Transport { .. }
        })
    ));
    assert!(!destination.join("Content/a.pak").exists());
    assert!(no_partials_under(&destination));
}

#[tokio::test]
async fn checksum_mismatch_fails_and_removes_partial() {
    let server = MockServer::start().await;
    serve(
        &server,
        "Content/a.pak",
        ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("Sugar");
    let client = Arc::new(FakeClient::new());
    client.set_manifest(Ok(listing(
        &server,
        vec![entry("Content/a.pak", 5, digest(b"ALPHA"))],
    )));

    let (mut job, mut status) =
        started_job(&destination, http_deps(client, &PathLocks::new())).await;
    let events = drain(&mut status).await;

    assert_eq!(job.wait().await, JobState::Failed);
    match events.last() {
        Some(StatusEvent::Failed {
            error: Error::Transport { message, .. },
        }) => assert!(message.contains("checksum mismatch"), "{message}"),
        other => panic!("unexpected final event {other:?}"),
    }
    assert!(!destination.join("Content/a.pak").exists());
    assert!(!destination.join("Content/a.pak.part").exists());
}

#[tokio::test]
async fn cancel_during_a_stalled_request_cleans_up() {
    let server = MockServer::start().await;
    serve(
        &server,
        "Content/a.pak",
        ResponseTemplate::new(200)
            .set_body_bytes(b"alpha".to_vec())
            .set_delay(Duration::from_secs(30)),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("Sugar");
    let client = Arc::new(FakeClient::new());
    client.set_manifest(Ok(listing(&server, vec![entry("Content/a.pak", 5, None)])));
    let locks = PathLocks::new();

    let (mut job, mut status) = started_job(&destination, http_deps(client, &locks)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    job.control().cancel().unwrap();

    let state = tokio::time::timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("cancel did not interrupt the request");
    assert_eq!(state, JobState::Cancelled);
    assert_eq!(drain(&mut status).await.last(), Some(&StatusEvent::Cancelled));
    assert!(!destination.join("Content/a.pak").exists());
    assert!(no_partials_under(&destination));
    assert!(!locks.is_held(&destination));
}

#[tokio::test]
async fn cdn_rejecting_the_token_invalidates_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sugar/Content/a.pak"))
        .and(header("authorization", "Bearer fresh-at"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("Sugar");
    let client = Arc::new(FakeClient::new());
    client.set_manifest(Ok(listing(&server, vec![entry("Content/a.pak", 5, None)])));
    let store = Arc::new(MemoryCredentialStore::new(Some(record(
        "old",
        "rt",
        TimeDelta::hours(-1),
    ))));
    let sessions = Arc::new(SessionManager::new(client.clone(), store.clone()));
    let held = sessions.authenticate().await.unwrap();

    let deps = http_deps(client, &PathLocks::new()).with_sessions(Arc::clone(&sessions));
    let mut job = DownloadJob::create(held, params(&destination), deps).unwrap();
    job.analyze().await.unwrap();
    let mut status = job.start().unwrap();
    let events = drain(&mut status).await;

    assert_eq!(job.wait().await, JobState::Failed);
    assert_eq!(
        events.last(),
        Some(&StatusEvent::Failed {
            error: Error::InvalidCredentials
        })
    );
    assert!(sessions.current().is_none());
    assert!(store.snapshot().is_some());
}
