use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

use super::resource::{
    Account, ChangeSet, ChangeSetBuilder, FileState, Resource, ResourceID, ResourceProperties,
    join_path, split_path,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account {0} is not registered")]
    UnknownAccount(String),
    #[error("an account for this URL and user already exists")]
    AccountExists,
    #[error("corrupt store record: {0}")]
    Corrupt(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

const ACCOUNTS_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    base_url TEXT NOT NULL,
    username TEXT NOT NULL,
    label TEXT,
    UNIQUE(base_url, username)
)";

const RESOURCES_SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS resources (
        path TEXT PRIMARY KEY,
        parent_path TEXT,
        is_collection INTEGER NOT NULL,
        version TEXT NOT NULL,
        dirty INTEGER NOT NULL,
        updated INTEGER NOT NULL,
        content_type TEXT,
        content_length INTEGER,
        modified INTEGER,
        file_state TEXT NOT NULL,
        local_path TEXT,
        stored_version TEXT
    )",
    "CREATE INDEX IF NOT EXISTS resources_parent ON resources(parent_path)",
];

#[derive(Clone)]
struct AccountSlot {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// Durable, transactional storage of every account's mirror tree and body
/// cache. One registry database at the root plus, per account, a property
/// database and a content-addressed body directory. All mutations commit
/// atomically and report their observable effect as a [`ChangeSet`].
pub struct Store {
    root: PathBuf,
    accounts: SqlitePool,
    slots: Mutex<HashMap<String, AccountSlot>>,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn validate_component(component: &str) -> Result<(), StoreError> {
    if component.is_empty() {
        return Err(StoreError::InvalidArgument("path component is empty".into()));
    }
    if component.contains('/') {
        return Err(StoreError::InvalidArgument(
            "path component contains a separator".into(),
        ));
    }
    Ok(())
}

fn validate_path(path: &[String]) -> Result<(), StoreError> {
    for component in path {
        validate_component(component)?;
    }
    Ok(())
}

// LIKE prefix for subtree queries; % and _ are legal in resource names.
fn subtree_pattern(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len() + 2);
    for ch in key.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("/%");
    escaped
}

fn body_cache_key(path: &[String], version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(join_path(path).as_bytes());
    hasher.update(b"\n");
    hasher.update(version.as_bytes());
    let digest = hasher.finalize();
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

fn file_state_columns(state: &FileState) -> (&'static str, Option<String>, Option<String>) {
    match state {
        FileState::Absent => ("absent", None, None),
        FileState::Downloading => ("downloading", None, None),
        FileState::Present {
            local_path,
            stored_version,
        } => (
            "present",
            Some(local_path.display().to_string()),
            Some(stored_version.clone()),
        ),
    }
}

fn file_state_from_columns(
    state: &str,
    local_path: Option<String>,
    stored_version: Option<String>,
) -> Result<FileState, StoreError> {
    match state {
        "absent" => Ok(FileState::Absent),
        "downloading" => Ok(FileState::Downloading),
        "present" => match (local_path, stored_version) {
            (Some(local_path), Some(stored_version)) => Ok(FileState::Present {
                local_path: PathBuf::from(local_path),
                stored_version,
            }),
            _ => Err(StoreError::Corrupt(
                "present body without location or version".into(),
            )),
        },
        other => Err(StoreError::Corrupt(format!("unknown file state: {other}"))),
    }
}

fn resource_from_row(account: &str, row: &SqliteRow) -> Result<Resource, StoreError> {
    let path: String = row.try_get("path")?;
    let is_collection: i64 = row.try_get("is_collection")?;
    let dirty: i64 = row.try_get("dirty")?;
    let state: String = row.try_get("file_state")?;
    let local_path: Option<String> = row.try_get("local_path")?;
    let stored_version: Option<String> = row.try_get("stored_version")?;
    Ok(Resource {
        id: ResourceID::new(account, split_path(&path)),
        is_collection: is_collection != 0,
        version: row.try_get("version")?,
        dirty: dirty != 0,
        updated: row.try_get("updated")?,
        content_type: row.try_get("content_type")?,
        content_length: row.try_get("content_length")?,
        modified: row.try_get("modified")?,
        file_state: file_state_from_columns(&state, local_path, stored_version)?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StoreError> {
    let base_url: String = row.try_get("base_url")?;
    Ok(Account {
        id: row.try_get("id")?,
        base_url: Url::parse(&base_url)
            .map_err(|err| StoreError::Corrupt(format!("account base URL: {err}")))?,
        username: row.try_get("username")?,
        label: row.try_get("label")?,
    })
}

include!("store_impl.rs");

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
