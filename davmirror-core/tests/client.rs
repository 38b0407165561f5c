use davmirror_core::{
    Credentials, DavClient, DavError, normalize_etag, parse_modified, resource_url,
};
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOCS_MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/api/docs/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getetag>"dir-7"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/api/docs/report.pdf</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getetag>"123"</D:getetag>
        <D:getcontenttype>application/pdf</D:getcontenttype>
        <D:getcontentlength>55555</D:getcontentlength>
        <D:getlastmodified>Mon, 12 Jan 1998 09:25:56 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
    <D:propstat>
      <D:prop>
        <D:checked-in/>
      </D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/api/docs/Archive/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/api/docs/Archive/nested.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getetag>"deep"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

#[tokio::test]
async fn propfind_parses_self_and_one_level_of_children() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .and(header("depth", "1"))
        .and(body_string_contains("getetag"))
        .respond_with(ResponseTemplate::new(207).set_body_string(DOCS_MULTISTATUS))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/docs/", server.uri())).unwrap();
    let client = DavClient::new();
    let listing = client.retrieve_properties(&url, None).await.unwrap();

    assert!(listing.self_properties.is_collection);
    assert_eq!(listing.self_properties.version, "dir-7");
    assert_eq!(listing.children.len(), 2);

    let report = &listing.children["report.pdf"];
    assert!(!report.is_collection);
    assert_eq!(report.version, "123");
    assert_eq!(report.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(report.content_length, Some(55555));
    assert_eq!(report.modified, Some(884_597_156));

    let archive = &listing.children["Archive"];
    assert!(archive.is_collection);
    assert_eq!(archive.version, "");
}

#[tokio::test]
async fn propfind_sends_basic_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/api/docs/"))
        .and(header("authorization", "Basic cm9tZW86c2VjcmV0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(DOCS_MULTISTATUS))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/docs/", server.uri())).unwrap();
    let credentials = Credentials {
        username: "romeo".into(),
        password: "secret".into(),
    };
    DavClient::new()
        .retrieve_properties(&url, Some(&credentials))
        .await
        .unwrap();
}

#[tokio::test]
async fn propfind_maps_missing_resource_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/gone", server.uri())).unwrap();
    let err = DavClient::new()
        .retrieve_properties(&url, None)
        .await
        .expect_err("expected not-found");
    assert!(matches!(err, DavError::NotFound));
}

#[tokio::test]
async fn propfind_surfaces_authentication_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/", server.uri())).unwrap();
    let err = DavClient::new()
        .retrieve_properties(&url, None)
        .await
        .expect_err("expected auth challenge");
    assert!(matches!(err, DavError::AuthenticationRequired));
}

#[tokio::test]
async fn propfind_rejects_unexpected_status() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/", server.uri())).unwrap();
    let err = DavClient::new()
        .retrieve_properties(&url, None)
        .await
        .expect_err("expected status error");
    assert!(matches!(err, DavError::UnexpectedStatus(status) if status.as_u16() == 500));
}

#[test]
fn resource_url_joins_encoded_components() {
    let base = Url::parse("https://example.com/api/").unwrap();

    let leaf = resource_url(&base, &["a".into(), "b".into(), "c".into()], false).unwrap();
    assert_eq!(leaf.as_str(), "https://example.com/api/a/b/c");

    let collection = resource_url(&base, &["a".into(), "b".into()], true).unwrap();
    assert_eq!(collection.as_str(), "https://example.com/api/a/b/");

    let spaced = resource_url(&base, &["Hello World.txt".into()], false).unwrap();
    assert_eq!(spaced.as_str(), "https://example.com/api/Hello%20World.txt");

    let root = resource_url(&base, &[], true).unwrap();
    assert_eq!(root.as_str(), "https://example.com/api/");
}

#[test]
fn normalize_etag_strips_quotes_and_weak_prefix() {
    assert_eq!(normalize_etag("\"123\""), "123");
    assert_eq!(normalize_etag("W/\"abc\""), "abc");
    assert_eq!(normalize_etag("plain"), "plain");
}

#[test]
fn parse_modified_accepts_both_date_formats() {
    assert_eq!(
        parse_modified("Mon, 12 Jan 1998 09:25:56 GMT"),
        Some(884_597_156)
    );
    assert_eq!(parse_modified("1998-01-12T09:25:56Z"), Some(884_597_156));
    assert_eq!(parse_modified("not a date"), None);
}
