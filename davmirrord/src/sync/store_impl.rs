impl Store {
    /// Opens (and on first use creates) the persisted state below `root`.
    /// Idempotent; concurrent stores over the same directory are not
    /// supported.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let options = SqliteConnectOptions::new()
            .filename(root.join("accounts.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let accounts = SqlitePool::connect_with(options).await?;
        sqlx::query(ACCOUNTS_SCHEMA).execute(&accounts).await?;
        Ok(Self {
            root,
            accounts,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub async fn add_account(&self, base_url: &Url, username: &str) -> Result<Account, StoreError> {
        let existing = sqlx::query("SELECT id FROM accounts WHERE base_url = ?1 AND username = ?2")
            .bind(base_url.as_str())
            .bind(username)
            .fetch_optional(&self.accounts)
            .await?;
        if existing.is_some() {
            return Err(StoreError::AccountExists);
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            base_url: base_url.clone(),
            username: username.to_string(),
            label: None,
        };
        sqlx::query("INSERT INTO accounts (id, base_url, username, label) VALUES (?1, ?2, ?3, ?4)")
            .bind(&account.id)
            .bind(account.base_url.as_str())
            .bind(&account.username)
            .bind(&account.label)
            .execute(&self.accounts)
            .await?;
        Ok(account)
    }

    pub async fn update_account(
        &self,
        id: &str,
        label: Option<&str>,
    ) -> Result<Account, StoreError> {
        let result = sqlx::query("UPDATE accounts SET label = ?1 WHERE id = ?2")
            .bind(label)
            .bind(id)
            .execute(&self.accounts)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownAccount(id.to_string()));
        }
        self.account(id)
            .await?
            .ok_or_else(|| StoreError::UnknownAccount(id.to_string()))
    }

    /// Removes the account together with every resource, pending body and
    /// cached file below it.
    pub async fn remove_account(&self, id: &str) -> Result<(), StoreError> {
        let slot = self.slots.lock().await.remove(id);
        if let Some(slot) = slot {
            slot.pool.close().await;
        }
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id)
            .execute(&self.accounts)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownAccount(id.to_string()));
        }
        match tokio::fs::remove_dir_all(self.root.join(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All registered accounts in insertion order.
    pub async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows =
            sqlx::query("SELECT id, base_url, username, label FROM accounts ORDER BY rowid ASC")
                .fetch_all(&self.accounts)
                .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT id, base_url, username, label FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.accounts)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn resource(
        &self,
        account: &str,
        path: &[String],
    ) -> Result<Option<Resource>, StoreError> {
        validate_path(path)?;
        let slot = self.slot(account).await?;
        let row = sqlx::query(
            "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
             FROM resources WHERE path = ?1",
        )
        .bind(join_path(path))
        .fetch_optional(&slot.pool)
        .await?;
        row.as_ref().map(|row| resource_from_row(account, row)).transpose()
    }

    /// The resources exactly one level below `path`, in path order.
    pub async fn contents(
        &self,
        account: &str,
        path: &[String],
    ) -> Result<Vec<Resource>, StoreError> {
        validate_path(path)?;
        let slot = self.slot(account).await?;
        let rows = sqlx::query(
            "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
             FROM resources WHERE parent_path = ?1 ORDER BY path ASC",
        )
        .bind(join_path(path))
        .fetch_all(&slot.pool)
        .await?;
        rows.iter().map(|row| resource_from_row(account, row)).collect()
    }

    /// Collections whose subtrees await reconciliation, in path order.
    pub async fn dirty_collections(
        &self,
        account: &str,
        limit: u32,
    ) -> Result<Vec<Resource>, StoreError> {
        let slot = self.slot(account).await?;
        let rows = sqlx::query(
            "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
             FROM resources WHERE dirty = 1 AND is_collection = 1 ORDER BY path ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&slot.pool)
        .await?;
        rows.iter().map(|row| resource_from_row(account, row)).collect()
    }

    /// The central mutator. `properties` absent deletes the subtree rooted at
    /// `path`; present writes the node, materializing missing ancestors.
    /// `content` replaces the node's recorded children wholesale with the
    /// supplied one-level map; children it omits are deleted with their
    /// subtrees. Commits atomically and reports every node whose observable
    /// state changed.
    pub async fn update(
        &self,
        account: &str,
        path: &[String],
        properties: Option<&ResourceProperties>,
        content: Option<&BTreeMap<String, ResourceProperties>>,
    ) -> Result<ChangeSet, StoreError> {
        validate_path(path)?;
        if let Some(content) = content {
            match properties {
                None => {
                    return Err(StoreError::InvalidArgument(
                        "children supplied for a deletion".into(),
                    ));
                }
                Some(properties) if !properties.is_collection => {
                    return Err(StoreError::InvalidArgument(
                        "children supplied for a non-collection".into(),
                    ));
                }
                Some(_) => {}
            }
            for name in content.keys() {
                validate_component(name)?;
            }
        }

        let slot = self.slot(account).await?;
        let _guard = slot.write_lock.lock().await;
        let mut tx = slot.pool.begin().await?;
        let mut changes = ChangeSetBuilder::default();
        let mut stale = Vec::new();
        let now = now_unix();

        match properties {
            None => {
                delete_subtree(&mut tx, account, path, &mut changes, &mut stale).await?;
                materialize_ancestors(&mut tx, account, path, now, &mut changes, &mut stale)
                    .await?;
                dirty_ancestors(&mut tx, account, path, &mut changes).await?;
            }
            Some(properties) => {
                materialize_ancestors(&mut tx, account, path, now, &mut changes, &mut stale)
                    .await?;
                let dirty = write_node(
                    &mut tx,
                    account,
                    path,
                    properties,
                    content.is_some(),
                    now,
                    &mut changes,
                    &mut stale,
                )
                .await?;
                if let Some(content) = content {
                    for child_key in child_keys(&mut tx, &join_path(path)).await? {
                        let child_path = split_path(&child_key);
                        let known = child_path
                            .last()
                            .is_some_and(|name| content.contains_key(name));
                        if !known {
                            delete_subtree(&mut tx, account, &child_path, &mut changes, &mut stale)
                                .await?;
                        }
                    }
                    for (name, child_properties) in content {
                        let mut child_path = path.to_vec();
                        child_path.push(name.clone());
                        write_node(
                            &mut tx,
                            account,
                            &child_path,
                            child_properties,
                            false,
                            now,
                            &mut changes,
                            &mut stale,
                        )
                        .await?;
                    }
                }
                if dirty {
                    dirty_ancestors(&mut tx, account, path, &mut changes).await?;
                }
            }
        }

        tx.commit().await?;
        remove_stale_bodies(stale).await;
        Ok(changes.finish())
    }

    /// Adopts a downloaded body: moves `source` into the account's body
    /// cache and flips the resource to `present`, provided the resource
    /// still exists as a non-collection at exactly `version`. A stale
    /// transfer discards the temporary file and reports no change.
    pub async fn move_file(
        &self,
        source: &Path,
        version: &str,
        id: &ResourceID,
    ) -> Result<ChangeSet, StoreError> {
        validate_path(&id.path)?;
        let slot = self.slot(&id.account).await?;
        let _guard = slot.write_lock.lock().await;
        let mut tx = slot.pool.begin().await?;
        let key = join_path(&id.path);

        let node = fetch_node(&mut tx, &id.account, &key).await?;
        let Some(mut node) =
            node.filter(|node| !node.is_collection && node.version == version)
        else {
            // Stale adoption: the resource vanished, became a collection, or
            // moved on to another version while the body was in flight.
            drop(tx);
            remove_stale_bodies(vec![source.to_path_buf()]).await;
            return Ok(ChangeSet::default());
        };

        let files = self.root.join(&id.account).join("files");
        tokio::fs::create_dir_all(&files).await?;
        let target = files.join(body_cache_key(&id.path, version));
        tokio::fs::rename(source, &target).await?;

        sqlx::query(
            "UPDATE resources SET file_state = 'present', local_path = ?1, stored_version = ?2 WHERE path = ?3",
        )
        .bind(target.display().to_string())
        .bind(version)
        .bind(&key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        node.file_state = FileState::Present {
            local_path: target,
            stored_version: version.to_string(),
        };
        let mut changes = ChangeSetBuilder::default();
        changes.record_upserted(node);
        Ok(changes.finish())
    }

    /// Marks a body transfer as in flight. Only an `absent` non-collection
    /// transitions; anything else reports no change.
    pub async fn set_downloading(&self, id: &ResourceID) -> Result<ChangeSet, StoreError> {
        self.transition_file_state(id, FileState::Absent, FileState::Downloading)
            .await
    }

    /// Reverts an abandoned transfer back to `absent`.
    pub async fn clear_downloading(&self, id: &ResourceID) -> Result<ChangeSet, StoreError> {
        self.transition_file_state(id, FileState::Downloading, FileState::Absent)
            .await
    }

    async fn transition_file_state(
        &self,
        id: &ResourceID,
        from: FileState,
        to: FileState,
    ) -> Result<ChangeSet, StoreError> {
        validate_path(&id.path)?;
        let slot = self.slot(&id.account).await?;
        let _guard = slot.write_lock.lock().await;
        let mut tx = slot.pool.begin().await?;
        let key = join_path(&id.path);

        let node = fetch_node(&mut tx, &id.account, &key).await?;
        let Some(mut node) = node.filter(|node| !node.is_collection && node.file_state == from)
        else {
            return Ok(ChangeSet::default());
        };

        let (state, local_path, stored_version) = file_state_columns(&to);
        sqlx::query(
            "UPDATE resources SET file_state = ?1, local_path = ?2, stored_version = ?3 WHERE path = ?4",
        )
        .bind(state)
        .bind(local_path)
        .bind(stored_version)
        .bind(&key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        node.file_state = to;
        let mut changes = ChangeSetBuilder::default();
        changes.record_upserted(node);
        Ok(changes.finish())
    }

    /// Where the transfer layer stages bodies before [`Store::move_file`]
    /// adopts them; kept beside the body cache so adoption is a rename.
    pub fn staging_dir(&self, account: &str) -> PathBuf {
        self.root.join(account).join("incoming")
    }

    async fn slot(&self, account: &str) -> Result<AccountSlot, StoreError> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(account) {
            return Ok(slot.clone());
        }
        let registered = sqlx::query("SELECT 1 FROM accounts WHERE id = ?1")
            .bind(account)
            .fetch_optional(&self.accounts)
            .await?;
        if registered.is_none() {
            return Err(StoreError::UnknownAccount(account.to_string()));
        }
        let dir = self.root.join(account);
        tokio::fs::create_dir_all(dir.join("files")).await?;
        tokio::fs::create_dir_all(dir.join("incoming")).await?;
        let options = SqliteConnectOptions::new()
            .filename(dir.join("props.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        for statement in RESOURCES_SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let slot = AccountSlot {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        slots.insert(account.to_string(), slot.clone());
        Ok(slot)
    }
}

async fn fetch_node(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    key: &str,
) -> Result<Option<Resource>, StoreError> {
    let row = sqlx::query(
        "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
         FROM resources WHERE path = ?1",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(|row| resource_from_row(account, row)).transpose()
}

async fn child_keys(
    conn: &mut sqlx::SqliteConnection,
    parent_key: &str,
) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query("SELECT path FROM resources WHERE parent_path = ?1 ORDER BY path ASC")
        .bind(parent_key)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("path").map_err(StoreError::from))
        .collect()
}

async fn upsert_row(
    conn: &mut sqlx::SqliteConnection,
    resource: &Resource,
) -> Result<(), StoreError> {
    let (state, local_path, stored_version) = file_state_columns(&resource.file_state);
    let path = resource.path();
    let parent = (!path.is_empty()).then(|| join_path(&path[..path.len() - 1]));
    sqlx::query(
        "INSERT INTO resources (
            path, parent_path, is_collection, version, dirty, updated,
            content_type, content_length, modified, file_state, local_path, stored_version
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(path) DO UPDATE SET
            parent_path = excluded.parent_path,
            is_collection = excluded.is_collection,
            version = excluded.version,
            dirty = excluded.dirty,
            updated = excluded.updated,
            content_type = excluded.content_type,
            content_length = excluded.content_length,
            modified = excluded.modified,
            file_state = excluded.file_state,
            local_path = excluded.local_path,
            stored_version = excluded.stored_version",
    )
    .bind(join_path(path))
    .bind(parent)
    .bind(if resource.is_collection { 1 } else { 0 })
    .bind(&resource.version)
    .bind(if resource.dirty { 1 } else { 0 })
    .bind(resource.updated)
    .bind(&resource.content_type)
    .bind(resource.content_length)
    .bind(resource.modified)
    .bind(state)
    .bind(local_path)
    .bind(stored_version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn subtree_nodes(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    path: &[String],
) -> Result<Vec<Resource>, StoreError> {
    let key = join_path(path);
    let rows = if key.is_empty() {
        sqlx::query(
            "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
             FROM resources ORDER BY path ASC",
        )
        .fetch_all(&mut *conn)
        .await?
    } else {
        sqlx::query(
            "SELECT path, parent_path, is_collection, version, dirty, updated, content_type, content_length, modified, file_state, local_path, stored_version
             FROM resources WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\' ORDER BY path ASC",
        )
        .bind(&key)
        .bind(subtree_pattern(&key))
        .fetch_all(&mut *conn)
        .await?
    };
    rows.iter().map(|row| resource_from_row(account, row)).collect()
}

async fn delete_subtree(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    path: &[String],
    changes: &mut ChangeSetBuilder,
    stale: &mut Vec<PathBuf>,
) -> Result<(), StoreError> {
    let nodes = subtree_nodes(conn, account, path).await?;
    if nodes.is_empty() {
        return Ok(());
    }
    let key = join_path(path);
    if key.is_empty() {
        sqlx::query("DELETE FROM resources").execute(&mut *conn).await?;
    } else {
        sqlx::query("DELETE FROM resources WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'")
            .bind(&key)
            .bind(subtree_pattern(&key))
            .execute(&mut *conn)
            .await?;
    }
    for node in nodes {
        if let FileState::Present { local_path, .. } = &node.file_state {
            stale.push(local_path.clone());
        }
        changes.record_deleted(node);
    }
    Ok(())
}

/// Ensures every proper prefix of `path` exists as a collection. Freshly
/// created ancestors carry an empty version and enter the change set dirty;
/// a leaf found in ancestor position is replaced (it cannot have children).
async fn materialize_ancestors(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    path: &[String],
    now: i64,
    changes: &mut ChangeSetBuilder,
    stale: &mut Vec<PathBuf>,
) -> Result<(), StoreError> {
    for depth in 0..path.len() {
        let prefix = &path[..depth];
        let existing = fetch_node(conn, account, &join_path(prefix)).await?;
        match existing {
            Some(node) if node.is_collection => continue,
            Some(node) => {
                if let FileState::Present { local_path, .. } = &node.file_state {
                    stale.push(local_path.clone());
                }
            }
            None => {}
        }
        let materialized = Resource {
            id: ResourceID::new(account, prefix.to_vec()),
            is_collection: true,
            version: String::new(),
            dirty: true,
            updated: now,
            content_type: None,
            content_length: None,
            modified: None,
            file_state: FileState::Absent,
        };
        upsert_row(conn, &materialized).await?;
        changes.record_upserted(materialized);
    }
    Ok(())
}

/// Flags every existing ancestor of `path` as awaiting reconciliation.
async fn dirty_ancestors(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    path: &[String],
    changes: &mut ChangeSetBuilder,
) -> Result<(), StoreError> {
    for depth in 0..path.len() {
        let key = join_path(&path[..depth]);
        if let Some(node) = fetch_node(conn, account, &key).await?
            && !node.dirty
        {
            sqlx::query("UPDATE resources SET dirty = 1 WHERE path = ?1")
                .bind(&key)
                .execute(&mut *conn)
                .await?;
            let mut flagged = node;
            flagged.dirty = true;
            changes.record_upserted(flagged);
        }
    }
    Ok(())
}

/// Writes one node. A type change prunes the previous subtree first; a
/// version change invalidates the cached body. Returns whether the node is
/// left dirty: collections stay dirty unless their children were supplied in
/// the same update, except that an unchanged collection keeps its prior
/// reconciliation state.
#[allow(clippy::too_many_arguments)]
async fn write_node(
    conn: &mut sqlx::SqliteConnection,
    account: &str,
    path: &[String],
    properties: &ResourceProperties,
    children_supplied: bool,
    now: i64,
    changes: &mut ChangeSetBuilder,
    stale: &mut Vec<PathBuf>,
) -> Result<bool, StoreError> {
    let prior = fetch_node(conn, account, &join_path(path)).await?;
    let prior = match prior {
        Some(existing) if existing.is_collection != properties.is_collection => {
            delete_subtree(conn, account, path, changes, stale).await?;
            None
        }
        other => other,
    };

    let dirty = if !properties.is_collection || children_supplied {
        false
    } else if let Some(prior) = &prior
        && prior.version == properties.version
    {
        prior.dirty
    } else {
        true
    };

    if let Some(prior) = &prior {
        let unchanged = prior.version == properties.version
            && prior.content_type == properties.content_type
            && prior.content_length == properties.content_length
            && prior.modified == properties.modified
            && prior.dirty == dirty;
        if unchanged {
            return Ok(dirty);
        }
    }

    let file_state = match &prior {
        Some(existing) if existing.version == properties.version => existing.file_state.clone(),
        Some(existing) => {
            if let FileState::Present { local_path, .. } = &existing.file_state {
                stale.push(local_path.clone());
            }
            FileState::Absent
        }
        None => FileState::Absent,
    };

    let resource = Resource {
        id: ResourceID::new(account, path.to_vec()),
        is_collection: properties.is_collection,
        version: properties.version.clone(),
        dirty,
        updated: now,
        content_type: properties.content_type.clone(),
        content_length: properties.content_length,
        modified: properties.modified,
        file_state,
    };
    upsert_row(conn, &resource).await?;
    changes.record_upserted(resource);
    Ok(dirty)
}

async fn remove_stale_bodies(stale: Vec<PathBuf>) {
    for path in stale {
        if let Err(err) = tokio::fs::remove_file(&path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(file = %path.display(), error = %err, "failed to remove stale body");
        }
    }
}
