use reqwest::{Client, Method, StatusCode, header};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use url::Url;

use crate::multistatus::{Multistatus, MultistatusError, parse_multistatus};

// Requested for every traversal; servers omit what they do not support and
// the parser treats every property as optional.
const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getetag/>
    <D:getcontenttype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
  </D:prop>
</D:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base URL cannot carry path segments")]
    CannotBeBase,
    #[error("resource does not exist on the remote")]
    NotFound,
    #[error("remote requires authentication")]
    AuthenticationRequired,
    #[error("malformed multistatus response: {0}")]
    Malformed(#[from] MultistatusError),
    #[error("remote returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Default)]
pub struct DavClient {
    http: Client,
}

impl DavClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    /// Fetches the listed properties of the resource at `url` together with
    /// one level of children (Depth 1). Collections should be addressed with
    /// a trailing slash; see [`resource_url`].
    pub async fn retrieve_properties(
        &self,
        url: &Url,
        credentials: Option<&Credentials>,
    ) -> Result<Multistatus, DavError> {
        let method = Method::from_bytes(b"PROPFIND").expect("static method name");
        let mut request = self
            .http
            .request(method, url.clone())
            .header("Depth", "1")
            .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::MULTI_STATUS | StatusCode::OK => {
                let body = response.text().await?;
                Ok(parse_multistatus(&body, url)?)
            }
            StatusCode::NOT_FOUND => Err(DavError::NotFound),
            StatusCode::UNAUTHORIZED => Err(DavError::AuthenticationRequired),
            status => Err(DavError::UnexpectedStatus(status)),
        }
    }
}

/// Composes the remote URL for a mirrored path: the account base joined with
/// the percent-encoded components, with a trailing slash iff the target is
/// addressed as a collection.
pub fn resource_url(base: &Url, path: &[String], collection: bool) -> Result<Url, DavError> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| DavError::CannotBeBase)?;
        segments.pop_if_empty();
        for component in path {
            segments.push(component);
        }
        if collection {
            // A trailing empty segment renders as a trailing slash.
            segments.push("");
        }
    }
    Ok(url)
}

/// Strips the weak-validator prefix and surrounding quotes from an etag so
/// that header values and multistatus values compare equal.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    trimmed.trim_matches('"').to_string()
}

/// `getlastmodified` is an IMF-fixdate in the wild; some servers hand back
/// RFC 3339 instead, so both are accepted. The RFC 2822 parser only takes
/// numeric offsets, while HTTP dates carry the obsolete GMT zone name.
pub fn parse_modified(value: &str) -> Option<i64> {
    let value = value.trim();
    let numeric_offset = value.strip_suffix(" GMT").map(|rest| format!("{rest} +0000"));
    let value = numeric_offset.as_deref().unwrap_or(value);
    OffsetDateTime::parse(value, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(value, &Rfc3339))
        .ok()
        .map(OffsetDateTime::unix_timestamp)
}
