//! Destinations for extracted index data.
//!
//! Per-chunk payloads stream into one of: nowhere (dry runs), a single
//! file or stdout, one file per chunk in a folder, or the director
//! index SQL table via `LOAD DATA INFILE`.

use crate::db::sql_id;
use anyhow::{anyhow, Context, Result};
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection, Row};
use std::io::Write;
use std::path::PathBuf;

/// The controller metadata schema holding director index tables.
pub const CONTROLLER_SCHEMA: &str = "skymap";

pub enum IndexSink {
    /// Drop the data.
    Discard,
    /// Append everything to one file, or print to stdout when no path
    /// is given.
    File { path: Option<PathBuf> },
    /// One `<db>_<chunkId>.tsv` file per chunk.
    Folder { dir: PathBuf },
    /// Load into the index table.
    Table(TableSink),
}

pub struct TableSink {
    database_url: String,
    /// Index table name within the controller schema.
    table: String,
    /// Use `LOAD DATA LOCAL INFILE`: the file is read by this process,
    /// not by the MySQL server.
    local: bool,
    tmp_dir: PathBuf,
    transaction_id: Option<u32>,
    /// Opened on the first payload; one connection and at most one
    /// open transaction per job.
    conn: Option<MySqlConnection>,
    in_transaction: bool,
}

impl TableSink {
    pub fn new(
        database_url: impl Into<String>,
        table: impl Into<String>,
        local: bool,
        tmp_dir: impl Into<PathBuf>,
        transaction_id: Option<u32>,
    ) -> Self {
        TableSink {
            database_url: database_url.into(),
            table: table.into(),
            local,
            tmp_dir: tmp_dir.into(),
            transaction_id,
            conn: None,
            in_transaction: false,
        }
    }

    async fn load(&mut self, database: &str, chunk: u32, data: &str) -> Result<()> {
        // Stage the payload in a file the LOAD statement can read. In
        // non-local mode the file must be readable by the MySQL
        // service.
        let suffix = self.transaction_id.map(|id| format!("_p{id}")).unwrap_or_default();
        let path = self.tmp_dir.join(format!("{database}_{chunk}{suffix}"));
        std::fs::write(&path, data)
            .with_context(|| format!("failed to stage index data at {}", path.display()))?;

        if self.conn.is_none() {
            self.conn = Some(
                MySqlConnection::connect(&self.database_url)
                    .await
                    .context("failed to open the index load connection")?,
            );
        }
        let local = self.local;
        let query = format!(
            "LOAD DATA {}INFILE '{}' INTO TABLE {}.{}",
            if local { "LOCAL " } else { "" },
            path.display().to_string().replace('\'', "\\'"),
            sql_id(CONTROLLER_SCHEMA),
            sql_id(&self.table),
        );
        let conn = self.conn.as_mut().expect("connection opened above");

        sqlx::query("BEGIN").execute(&mut *conn).await?;
        self.in_transaction = true;
        let load = async {
            sqlx::query(&query).execute(&mut *conn).await?;
            if local {
                // A LOCAL load does not fail on malformed rows; it
                // warns. Treat any warning as corruption.
                let warnings = sqlx::query("SHOW WARNINGS").fetch_all(&mut *conn).await?;
                if let Some(first) = warnings.first() {
                    let message: String = first.try_get("Message").unwrap_or_default();
                    return Err(anyhow!(
                        "LOAD DATA LOCAL INFILE produced {} warning(s), first: {}",
                        warnings.len(),
                        message
                    ));
                }
            }
            Ok(())
        }
        .await;
        match load {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                self.in_transaction = false;
            }
            Err(e) => {
                return Err(e);
            }
        }

        // Best-effort cleanup of the staging file.
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::error!(path = %path.display(), "failed to remove the staging file: {e}");
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::error!("index load transaction rollback failed: {e}");
            }
        }
        self.in_transaction = false;
    }
}

impl IndexSink {
    /// Deliver one chunk's payload.
    pub async fn write(&mut self, database: &str, chunk: u32, data: &str) -> Result<()> {
        match self {
            IndexSink::Discard => Ok(()),
            IndexSink::File { path: None } => {
                print!("{data}");
                Ok(())
            }
            IndexSink::File { path: Some(path) } => {
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&*path)
                    .with_context(|| {
                        format!("failed to open for append: {}", path.display())
                    })?;
                f.write_all(data.as_bytes())
                    .with_context(|| format!("failed to append to {}", path.display()))?;
                Ok(())
            }
            IndexSink::Folder { dir } => {
                let path = dir.join(format!("{database}_{chunk}.tsv"));
                std::fs::write(&path, data)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Ok(())
            }
            IndexSink::Table(table) => table.load(database, chunk, data).await,
        }
    }

    /// Abandon any open SQL transaction. A no-op for the other sinks.
    pub async fn rollback(&mut self) {
        if let IndexSink::Table(table) = self {
            table.rollback().await;
        }
    }
}
