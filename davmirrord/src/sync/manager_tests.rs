use super::*;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::sync::resource::{FileState, ResourceProperties, join_path, split_path};
use crate::sync::transfer::TransferEvent;

const DOCS_LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/api/docs/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getetag>"d1"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/api/docs/a.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getetag>"1"</D:getetag>
        <D:getcontenttype>text/plain</D:getcontenttype>
        <D:getcontentlength>4</D:getcontentlength>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/api/docs/sub/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

const LEAF_LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/api/docs/a.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getetag>"2"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

struct StaticPasswords(Option<&'static str>);

#[async_trait::async_trait]
impl PasswordProvider for StaticPasswords {
    async fn password(&self, _account: &Account) -> Option<String> {
        self.0.map(str::to_string)
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    account: Account,
    manager: ResourceManager,
    changes: UnboundedReceiver<ChangeSet>,
    transfer_events: UnboundedReceiver<TransferEvent>,
}

async fn make_harness(server: &MockServer, password: Option<&'static str>) -> Harness {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).await.unwrap());
    let base = Url::parse(&format!("{}/api/", server.uri())).unwrap();
    let account = store.add_account(&base, "romeo").await.unwrap();
    let passwords: Arc<dyn PasswordProvider> = Arc::new(StaticPasswords(password));
    let (transfer_tx, transfer_events) = mpsc::unbounded_channel();
    let transfers = Arc::new(DownloadManager::new(
        account.clone(),
        Arc::clone(&store),
        "com.example.app",
        Arc::clone(&passwords),
        transfer_tx,
    ));
    let (changes_tx, changes) = mpsc::unbounded_channel();
    let manager = ResourceManager::new(
        account.clone(),
        Arc::clone(&store),
        DavClient::new(),
        transfers,
        passwords,
        changes_tx,
    );
    Harness {
        _dir: dir,
        store,
        account,
        manager,
        changes,
        transfer_events,
    }
}

async fn seed_leaf(harness: &Harness, remote_path: &str, version: &str) {
    let properties = ResourceProperties {
        is_collection: false,
        version: version.into(),
        content_type: None,
        content_length: None,
        modified: None,
    };
    harness
        .store
        .update(
            &harness.account.id,
            &split_path(remote_path),
            Some(&properties),
            None,
        )
        .await
        .unwrap();
}

async fn next_transfer_event(harness: &mut Harness) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(5), harness.transfer_events.recv())
        .await
        .expect("transfer event within deadline")
        .expect("transfer channel open")
}

#[tokio::test]
async fn reconcile_writes_the_listing_and_schedules_missing_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .respond_with(ResponseTemplate::new(207).set_body_string(DOCS_LISTING))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/docs/a.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("etag", "\"1\"")
                .set_body_bytes(b"data".as_slice()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server, None).await;
    let changes = harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .unwrap();

    let written: Vec<String> = changes
        .inserted_or_updated
        .iter()
        .map(|resource| join_path(resource.path()))
        .collect();
    assert_eq!(written, vec!["", "docs", "docs/a.txt", "docs/sub"]);
    assert!(changes.deleted.is_empty());

    let docs = harness
        .store
        .resource(&harness.account.id, &split_path("docs"))
        .await
        .unwrap()
        .unwrap();
    assert!(docs.is_collection);
    assert!(!docs.dirty, "children came with the listing");
    assert_eq!(docs.version, "d1");

    let sub = harness
        .store
        .resource(&harness.account.id, &split_path("docs/sub"))
        .await
        .unwrap()
        .unwrap();
    assert!(sub.is_collection);
    assert!(sub.dirty, "child collections await their own reconcile");

    let forwarded = harness.changes.recv().await.unwrap();
    assert_eq!(forwarded, changes);

    assert!(matches!(
        next_transfer_event(&mut harness).await,
        TransferEvent::Started { .. }
    ));
    assert!(matches!(
        next_transfer_event(&mut harness).await,
        TransferEvent::Finished { .. }
    ));
    let leaf = harness
        .store
        .resource(&harness.account.id, &split_path("docs/a.txt"))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(leaf.file_state, FileState::Present { .. }));
}

#[tokio::test]
async fn leaf_reconcile_addresses_the_resource_without_a_slash() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/a.txt"))
        .respond_with(ResponseTemplate::new(207).set_body_string(LEAF_LISTING))
        .expect(1)
        .mount(&server)
        .await;

    let harness = make_harness(&server, None).await;
    seed_leaf(&harness, "docs/a.txt", "1").await;

    let changes = harness
        .manager
        .update_resource(&split_path("docs/a.txt"))
        .await
        .unwrap();
    assert_eq!(changes.inserted_or_updated.len(), 1);

    let leaf = harness
        .store
        .resource(&harness.account.id, &split_path("docs/a.txt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leaf.version, "2");
}

#[tokio::test]
async fn missing_remote_resource_deletes_the_subtree() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let harness = make_harness(&server, None).await;
    seed_leaf(&harness, "docs/a.txt", "1").await;

    let changes = harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .unwrap();

    let removed: Vec<String> = changes
        .deleted
        .iter()
        .map(|resource| join_path(resource.path()))
        .collect();
    assert_eq!(removed, vec!["docs", "docs/a.txt"]);
    assert!(
        harness
            .store
            .resource(&harness.account.id, &split_path("docs"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn concurrent_updates_for_one_path_coalesce() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .respond_with(
            ResponseTemplate::new(207)
                .set_body_string(DOCS_LISTING)
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("etag", "\"1\"")
                .set_body_bytes(b"data".as_slice()),
        )
        .mount(&server)
        .await;

    let harness = make_harness(&server, None).await;
    let target = split_path("docs");
    let (first, second) = tokio::join!(
        harness.manager.update_resource(&target),
        harness.manager.update_resource(&target),
    );

    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn remote_failure_leaves_the_store_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = make_harness(&server, None).await;
    let err = harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .expect_err("expected status error");

    assert!(matches!(err, ManagerError::UnexpectedStatus(500)));
    assert!(
        harness
            .store
            .resource(&harness.account.id, &[])
            .await
            .unwrap()
            .is_none(),
        "a failed reconcile must not write anything"
    );
}

#[tokio::test]
async fn credential_challenge_is_answered_once_and_cached() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .and(header("authorization", "Basic cm9tZW86c2VjcmV0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(DOCS_LISTING))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("etag", "\"1\"")
                .set_body_bytes(b"data".as_slice()),
        )
        .mount(&server)
        .await;

    let harness = make_harness(&server, Some("secret")).await;
    harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .unwrap();
    harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .unwrap();
}

#[tokio::test]
async fn declined_credentials_surface_the_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let harness = make_harness(&server, None).await;
    let err = harness
        .manager
        .update_resource(&split_path("docs"))
        .await
        .expect_err("expected auth error");
    assert!(matches!(err, ManagerError::AuthenticationRequired));
}
