pub mod client;
pub mod multistatus;

pub use client::{Credentials, DavClient, DavError, normalize_etag, parse_modified, resource_url};
pub use multistatus::{Multistatus, MultistatusError, ResourceProperties, parse_multistatus};
