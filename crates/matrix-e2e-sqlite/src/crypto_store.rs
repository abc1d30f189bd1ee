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
use matrix_e2e_crypto::store::{CryptoStore, Result as StoreResult};
use ruma::{DeviceId, RoomId, UserId};
use tracing::debug;

use crate::{
    error::{Error, Result},
    utils::{create_pool, load_db_version, SqliteAsyncConnExt, SqliteTransactionExt},
    OpenStoreError,
};

/// The database name.
const DATABASE_NAME: &str = "matrix-e2e-crypto.sqlite3";

const DATABASE_VERSION: u8 = 1;

/// Key of the tracked users in the key/value table.
const TRACKED_USERS: &str = "tracked_users";

/// A sqlite based cryptostore.
#[derive(Clone)]
pub struct SqliteCryptoStore {
    pool: SqlitePool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteCryptoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCryptoStore").finish_non_exhaustive()
    }
}

impl SqliteCryptoStore {
    /// Open the sqlite-based crypto store in the given directory.
    ///
    /// The values the `OlmMachine` hands us are already encrypted with its
    /// pickle key where needed, the store doesn't add its own encryption.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenStoreError> {
        let pool = create_pool(path.as_ref(), DATABASE_NAME).await?;
        Self::open_with_pool(pool).await
    }

    /// Create a sqlite-based crypto store using the given sqlite database
    /// pool.
    pub async fn open_with_pool(pool: SqlitePool) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;
        let version = load_db_version(&conn).await?;
        run_migrations(&conn, version).await?;

        Ok(Self { pool })
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }

    async fn get_text(&self, sql: &'static str, key: String) -> Result<Option<String>> {
        self.acquire().await?.query_row(sql, (key,), |row| row.get(0)).await
    }

    async fn set_text(&self, sql: &'static str, key: String, value: String) -> Result<()> {
        self.acquire().await?.execute(sql, (key, value)).await?;
        Ok(())
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
        // First turn on WAL mode, this can't be done in the transaction, it fails with
        // the error message: "cannot change into wal mode from within a transaction".
        conn.execute_batch("PRAGMA journal_mode = wal;").await?;
        conn.with_transaction(|txn| {
            txn.execute_batch(include_str!("../migrations/crypto_store/001_init.sql"))?;
            txn.set_db_version(1)
        })
        .await?;
    }

    Ok(())
}

#[async_trait]
impl CryptoStore for SqliteCryptoStore {
    async fn load_account(&self, device_id: &DeviceId) -> StoreResult<Option<String>> {
        Ok(self
            .get_text("SELECT data FROM account WHERE device_id = ?", device_id.to_string())
            .await?)
    }

    async fn save_account(&self, device_id: &DeviceId, account: String) -> StoreResult<()> {
        Ok(self
            .set_text(
                "INSERT INTO account (device_id, data) VALUES (?1, ?2) \
                 ON CONFLICT (device_id) DO UPDATE SET data = ?2",
                device_id.to_string(),
                account,
            )
            .await?)
    }

    async fn get_sessions(&self, sender_key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_text("SELECT data FROM session WHERE sender_key = ?", sender_key.to_owned())
            .await?)
    }

    async fn save_sessions(&self, sender_key: &str, sessions: String) -> StoreResult<()> {
        Ok(self
            .set_text(
                "INSERT INTO session (sender_key, data) VALUES (?1, ?2) \
                 ON CONFLICT (sender_key) DO UPDATE SET data = ?2",
                sender_key.to_owned(),
                sessions,
            )
            .await?)
    }

    async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<Option<String>> {
        Ok(self.get_text("SELECT data FROM device WHERE user_id = ?", user_id.to_string()).await?)
    }

    async fn save_user_devices(&self, user_id: &UserId, devices: String) -> StoreResult<()> {
        Ok(self
            .set_text(
                "INSERT INTO device (user_id, data) VALUES (?1, ?2) \
                 ON CONFLICT (user_id) DO UPDATE SET data = ?2",
                user_id.to_string(),
                devices,
            )
            .await?)
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> StoreResult<Option<String>> {
        Ok(self
            .get_text("SELECT data FROM room_settings WHERE room_id = ?", room_id.to_string())
            .await?)
    }

    async fn save_room_settings(
        &self,
        room_id: &RoomId,
        settings: String,
    ) -> StoreResult<()> {
        Ok(self
            .set_text(
                "INSERT INTO room_settings (room_id, data) VALUES (?1, ?2) \
                 ON CONFLICT (room_id) DO UPDATE SET data = ?2",
                room_id.to_string(),
                settings,
            )
            .await?)
    }

    async fn remove_room_settings(&self, room_id: &RoomId) -> StoreResult<()> {
        let room_id = room_id.to_string();
        self.acquire()
            .await?
            .execute("DELETE FROM room_settings WHERE room_id = ?", (room_id,))
            .await?;
        Ok(())
    }

    async fn load_tracked_users(&self) -> StoreResult<Option<String>> {
        let Some(value) = self.acquire().await?.get_kv(TRACKED_USERS).await? else {
            return Ok(None);
        };

        Ok(Some(String::from_utf8(value).map_err(Error::from)?))
    }

    async fn save_tracked_users(&self, users: String) -> StoreResult<()> {
        Ok(self.acquire().await?.set_kv(TRACKED_USERS, users.into_bytes()).await?)
    }
}

#[cfg(test)]
mod tests {
    use once_cell::sync::Lazy;
    use tempfile::{tempdir, TempDir};

    use super::SqliteCryptoStore;

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());

    async fn get_store(name: &str) -> SqliteCryptoStore {
        let tmpdir_path = TMP_DIR.path().join(name);

        SqliteCryptoStore::open(tmpdir_path.to_str().unwrap())
            .await
            .expect("Can't create a sqlite crypto store")
    }

    matrix_e2e_crypto::cryptostore_integration_tests!();

    #[tokio::test]
    async fn test_reopening_keeps_the_data() {
        use matrix_e2e_crypto::store::CryptoStore;
        use ruma::device_id;

        let path = TMP_DIR.path().join("reopening");

        let store = SqliteCryptoStore::open(&path).await.unwrap();
        store.save_account(device_id!("DEVICEID"), "pickle".to_owned()).await.unwrap();
        store.save_tracked_users(r#"["@alice:localhost"]"#.to_owned()).await.unwrap();
        drop(store);

        let store = SqliteCryptoStore::open(&path).await.unwrap();
        assert_eq!(
            store.load_account(device_id!("DEVICEID")).await.unwrap().as_deref(),
            Some("pickle")
        );
        assert_eq!(
            store.load_tracked_users().await.unwrap().as_deref(),
            Some(r#"["@alice:localhost"]"#)
        );
    }
}
