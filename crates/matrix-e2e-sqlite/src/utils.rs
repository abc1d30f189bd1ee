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

use std::path::Path;

use async_trait::async_trait;
use deadpool_sqlite::{Config, Object as SqliteAsyncConn, Pool as SqlitePool, Runtime};
use rusqlite::{OptionalExtension, Params, Row, Transaction};
use tokio::fs;

use crate::{error::Result, OpenStoreError};

/// Create the directory at `path` and a connection pool for the database
/// file `name` inside it.
pub(crate) async fn create_pool(path: &Path, name: &str) -> Result<SqlitePool, OpenStoreError> {
    fs::create_dir_all(path).await.map_err(OpenStoreError::CreateDir)?;
    let config = Config::new(path.join(name));
    Ok(config.create_pool(Runtime::Tokio1)?)
}

#[async_trait]
pub(crate) trait SqliteAsyncConnExt {
    async fn execute<P>(&self, sql: impl AsRef<str> + Send + 'static, params: P) -> Result<usize>
    where
        P: Params + Send + 'static;

    async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()>;

    async fn query_row<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T> + Send + 'static;

    async fn query_many<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static;

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static;

    async fn get_kv(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_kv(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl SqliteAsyncConnExt for SqliteAsyncConn {
    async fn execute<P>(&self, sql: impl AsRef<str> + Send + 'static, params: P) -> Result<usize>
    where
        P: Params + Send + 'static,
    {
        Ok(self.interact(move |conn| conn.execute(sql.as_ref(), params)).await??)
    }

    async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()> {
        Ok(self.interact(move |conn| conn.execute_batch(sql.as_ref())).await??)
    }

    async fn query_row<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self.interact(move |conn| conn.query_row(sql.as_ref(), params, f).optional()).await??)
    }

    async fn query_many<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self
            .interact(move |conn| {
                let mut stmt = conn.prepare(sql.as_ref())?;
                let rows = stmt.query_map(params, f)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await??)
    }

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.interact(move |conn| {
            let txn = conn.transaction()?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await?
    }

    async fn get_kv(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_owned();
        self.query_row("SELECT value FROM kv WHERE key = ?", (key,), |row| row.get(0)).await
    }

    async fn set_kv(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_owned();
        self.with_transaction(move |txn| Ok(txn.set_kv(&key, &value)?)).await
    }
}

pub(crate) trait SqliteTransactionExt {
    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()>;

    fn set_db_version(&self, version: u8) -> Result<()> {
        Ok(self.set_kv("version", &[version])?)
    }
}

impl SqliteTransactionExt for Transaction<'_> {
    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO kv VALUES (?1, ?2) ON CONFLICT (key) DO UPDATE SET value = ?2",
            (key, value),
        )?;
        Ok(())
    }
}

/// Load the version of the database with the given connection.
pub(crate) async fn load_db_version(conn: &SqliteAsyncConn) -> Result<u8, OpenStoreError> {
    let kv_exists = conn
        .interact(|conn| {
            conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
                (),
                |row| row.get::<_, u32>(0),
            )
        })
        .await
        .map_err(|e| OpenStoreError::Interact(e.to_string()))?
        .map_err(OpenStoreError::LoadVersion)?
        > 0;

    if !kv_exists {
        return Ok(0);
    }

    let version = conn
        .interact(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = 'version'", (), |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
        .await
        .map_err(|e| OpenStoreError::Interact(e.to_string()))?
        .map_err(OpenStoreError::LoadVersion)?;

    match version.as_deref() {
        Some([v]) => Ok(*v),
        Some(_) => Err(OpenStoreError::InvalidVersion),
        None => Err(OpenStoreError::MissingVersion),
    }
}

#[cfg(test)]
mod unit_tests {
    use tempfile::tempdir;

    use super::{create_pool, load_db_version, SqliteAsyncConnExt, SqliteTransactionExt};

    #[tokio::test]
    async fn test_kv_roundtrip_and_version() {
        let dir = tempdir().unwrap();
        let pool = create_pool(dir.path(), "test.sqlite3").await.unwrap();
        let conn = pool.get().await.unwrap();

        assert_eq!(load_db_version(&conn).await.unwrap(), 0);

        conn.execute_batch("CREATE TABLE kv (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL);")
            .await
            .unwrap();
        assert!(load_db_version(&conn).await.is_err());

        conn.with_transaction(|txn| txn.set_db_version(3)).await.unwrap();
        assert_eq!(load_db_version(&conn).await.unwrap(), 3);

        conn.set_kv("key", b"first".to_vec()).await.unwrap();
        conn.set_kv("key", b"second".to_vec()).await.unwrap();
        assert_eq!(conn.get_kv("key").await.unwrap().as_deref(), Some(&b"second"[..]));
        assert!(conn.get_kv("missing").await.unwrap().is_none());
    }
}
