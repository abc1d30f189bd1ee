// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, path::Path};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool};
use matrix_e2e_base::{
    store::{Result as StoreResult, StateChanges, StateStore},
    RoomInfo,
};
use ruma::RoomId;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    utils::{create_pool, load_db_version, SqliteAsyncConnExt, SqliteTransactionExt},
    OpenStoreError,
};

/// The database name.
const DATABASE_NAME: &str = "matrix-e2e-state.sqlite3";

const DATABASE_VERSION: u8 = 1;

/// Key of the sync token in the key/value table.
const SYNC_TOKEN: &str = "sync_token";

/// A sqlite based state store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Open the sqlite-based state store in the given directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenStoreError> {
        let pool = create_pool(path.as_ref(), DATABASE_NAME).await?;
        Self::open_with_pool(pool).await
    }

    /// Create a sqlite-based state store using the given sqlite database pool.
    pub async fn open_with_pool(pool: SqlitePool) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;
        let version = load_db_version(&conn).await?;
        run_migrations(&conn, version).await?;

        Ok(Self { pool })
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }
}

/// Run migrations for the given version of the database.
async fn run_migrations(conn: &SqliteAsyncConn, version: u8) -> Result<()> {
    if version == 0 {
        debug!("Creating database");
    } else if version < DATABASE_VERSION {
        debug!(version, new_version = DATABASE_VERSION, "Upgrading database");
    } else {
        return Ok(());
    }

    if version < 1 {
        conn.execute_batch("PRAGMA journal_mode = wal;").await?;
        conn.with_transaction(|txn| {
            txn.execute_batch(include_str!("../migrations/state_store/001_init.sql"))?;
            txn.set_db_version(1)
        })
        .await?;
    }

    Ok(())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip_all)]
    async fn save_changes(&self, changes: &StateChanges) -> StoreResult<()> {
        let sync_token = changes.sync_token.clone();

        let room_infos = changes
            .room_infos
            .iter()
            .map(|(room_id, info)| Ok((room_id.to_string(), serde_json::to_string(info)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut state_events = Vec::new();
        for (room_id, event_types) in &changes.state {
            for (event_type, events) in event_types {
                for (state_key, event) in events {
                    state_events.push((
                        room_id.to_string(),
                        event_type.clone(),
                        state_key.clone(),
                        serde_json::to_string(event).map_err(Error::from)?,
                    ));
                }
            }
        }

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                if let Some(token) = sync_token {
                    txn.set_kv(SYNC_TOKEN, token.as_bytes())?;
                }

                for (room_id, data) in room_infos {
                    txn.execute(
                        "INSERT INTO room_info (room_id, data) VALUES (?1, ?2) \
                         ON CONFLICT (room_id) DO UPDATE SET data = ?2",
                        (room_id, data),
                    )?;
                }

                for (room_id, event_type, state_key, data) in state_events {
                    txn.execute(
                        "INSERT INTO state_event (room_id, event_type, state_key, data) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT (room_id, event_type, state_key) DO UPDATE SET data = ?4",
                        (room_id, event_type, state_key, data),
                    )?;
                }

                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn get_sync_token(&self) -> StoreResult<Option<String>> {
        let Some(token) = self.acquire().await?.get_kv(SYNC_TOKEN).await? else {
            return Ok(None);
        };

        Ok(Some(String::from_utf8(token).map_err(Error::from)?))
    }

    async fn get_room_infos(&self) -> StoreResult<Vec<RoomInfo>> {
        let rows: Vec<String> = self
            .acquire()
            .await?
            .query_many("SELECT data FROM room_info", (), |row| row.get(0))
            .await?;

        Ok(rows.iter().map(|data| serde_json::from_str(data)).collect::<Result<_, _>>()?)
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> StoreResult<Option<JsonValue>> {
        let params = (room_id.to_string(), event_type.to_owned(), state_key.to_owned());
        let data: Option<String> = self
            .acquire()
            .await?
            .query_row(
                "SELECT data FROM state_event \
                 WHERE room_id = ?1 AND event_type = ?2 AND state_key = ?3",
                params,
                |row| row.get(0),
            )
            .await?;

        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn get_state_events(
        &self,
        room_id: &RoomId,
        event_type: &str,
    ) -> StoreResult<Vec<JsonValue>> {
        let params = (room_id.to_string(), event_type.to_owned());
        let rows: Vec<String> = self
            .acquire()
            .await?
            .query_many(
                "SELECT data FROM state_event WHERE room_id = ?1 AND event_type = ?2",
                params,
                |row| row.get(0),
            )
            .await?;

        Ok(rows.iter().map(|data| serde_json::from_str(data)).collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use once_cell::sync::Lazy;
    use tempfile::{tempdir, TempDir};

    use super::SqliteStateStore;

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());

    async fn get_store(name: &str) -> SqliteStateStore {
        let tmpdir_path = TMP_DIR.path().join(name);

        SqliteStateStore::open(tmpdir_path.to_str().unwrap())
            .await
            .expect("Can't create a sqlite state store")
    }

    matrix_e2e_base::statestore_integration_tests!();

    #[tokio::test]
    async fn test_sync_token_survives_reopening() {
        use matrix_e2e_base::store::{StateChanges, StateStore};

        let path = TMP_DIR.path().join("sync_token_reopening");

        let store = SqliteStateStore::open(&path).await.unwrap();
        store.save_changes(&StateChanges::new("s42".to_owned())).await.unwrap();
        drop(store);

        let store = SqliteStateStore::open(&path).await.unwrap();
        assert_eq!(store.get_sync_token().await.unwrap().as_deref(), Some("s42"));
    }
}
