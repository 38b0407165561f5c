use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;
use url::Url;

use crate::client::{normalize_etag, parse_modified};

#[derive(Debug, Error)]
pub enum MultistatusError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("no entry describes the request target")]
    MissingTarget,
}

/// The property record extracted for one resource: its type, version token
/// and last-known body metadata. Everything except the type is optional on
/// the wire; a missing etag maps to an empty version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceProperties {
    pub is_collection: bool,
    pub version: String,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub modified: Option<i64>,
}

/// A parsed Depth-1 traversal: the requested resource itself plus its
/// immediate children keyed by decoded name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multistatus {
    pub self_properties: ResourceProperties,
    pub children: BTreeMap<String, ResourceProperties>,
}

#[derive(Default)]
struct PendingPropstat {
    collection: bool,
    etag: Option<String>,
    content_type: Option<String>,
    content_length: Option<i64>,
    modified: Option<i64>,
    status_ok: bool,
}

#[derive(Default)]
struct PendingResponse {
    href: Option<String>,
    properties: ResourceProperties,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    Href,
    Etag,
    ContentType,
    ContentLength,
    Modified,
    Status,
}

/// Extracts self- and child-properties from a `207 Multi-Status` body.
///
/// Entries whose href is neither the request target nor exactly one level
/// beneath it are ignored; servers routinely volunteer extra responses.
pub fn parse_multistatus(xml: &str, request_url: &Url) -> Result<Multistatus, MultistatusError> {
    let request_segments = decoded_segments(request_url);

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut self_properties: Option<ResourceProperties> = None;
    let mut children: BTreeMap<String, ResourceProperties> = BTreeMap::new();

    let mut response: Option<PendingResponse> = None;
    let mut propstat = PendingPropstat::default();
    let mut in_resourcetype = false;
    let mut capture = Capture::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"response" => {
                    response = Some(PendingResponse::default());
                }
                b"propstat" => propstat = PendingPropstat::default(),
                b"resourcetype" => in_resourcetype = true,
                b"collection" if in_resourcetype => propstat.collection = true,
                b"href" => {
                    if let Some(pending) = &response
                        && pending.href.is_none()
                    {
                        capture = Capture::Href;
                    }
                }
                b"getetag" => capture = Capture::Etag,
                b"getcontenttype" => capture = Capture::ContentType,
                b"getcontentlength" => capture = Capture::ContentLength,
                b"getlastmodified" => capture = Capture::Modified,
                b"status" => capture = Capture::Status,
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                if in_resourcetype && element.local_name().as_ref() == b"collection" {
                    propstat.collection = true;
                }
            }
            Ok(Event::Text(text)) => {
                let value = text.unescape().unwrap_or_default().into_owned();
                match capture {
                    Capture::Href => {
                        if let Some(pending) = response.as_mut() {
                            pending.href = Some(value);
                        }
                    }
                    Capture::Etag => propstat.etag = Some(normalize_etag(&value)),
                    Capture::ContentType => propstat.content_type = Some(value),
                    Capture::ContentLength => propstat.content_length = value.trim().parse().ok(),
                    Capture::Modified => propstat.modified = parse_modified(value.trim()),
                    Capture::Status => propstat.status_ok = status_is_ok(&value),
                    Capture::None => {}
                }
                capture = Capture::None;
            }
            Ok(Event::End(element)) => {
                capture = Capture::None;
                match element.local_name().as_ref() {
                    b"resourcetype" => in_resourcetype = false,
                    b"propstat" => {
                        if propstat.status_ok
                            && let Some(pending) = response.as_mut()
                        {
                            merge_propstat(&mut pending.properties, &propstat);
                        }
                        propstat = PendingPropstat::default();
                    }
                    b"response" => {
                        if let Some(pending) = response.take()
                            && let Some(href) = &pending.href
                            && let Ok(entry_url) = request_url.join(href)
                        {
                            let segments = decoded_segments(&entry_url);
                            if segments == request_segments {
                                self_properties.get_or_insert(pending.properties);
                            } else if segments.len() == request_segments.len() + 1
                                && segments[..request_segments.len()] == request_segments[..]
                            {
                                let name = segments[segments.len() - 1].clone();
                                children.entry(name).or_insert(pending.properties);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(MultistatusError::Xml(err)),
            _ => {}
        }
    }

    let self_properties = self_properties.ok_or(MultistatusError::MissingTarget)?;
    Ok(Multistatus {
        self_properties,
        children,
    })
}

fn merge_propstat(properties: &mut ResourceProperties, propstat: &PendingPropstat) {
    if propstat.collection {
        properties.is_collection = true;
    }
    if let Some(etag) = &propstat.etag {
        properties.version = etag.clone();
    }
    if propstat.content_type.is_some() {
        properties.content_type = propstat.content_type.clone();
    }
    if propstat.content_length.is_some() {
        properties.content_length = propstat.content_length;
    }
    if propstat.modified.is_some() {
        properties.modified = propstat.modified;
    }
}

fn status_is_ok(status_line: &str) -> bool {
    status_line.split_whitespace().nth(1) == Some("200")
}

fn decoded_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| {
            segments
                .filter(|segment| !segment.is_empty())
                .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}
