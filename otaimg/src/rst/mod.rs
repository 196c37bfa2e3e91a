//! The resource table: content-addressed resources and their filter graph.

mod prepare;

pub use prepare::{
    scan_download_dir, ResourceDownloadInfo, ResourcePreparer, ScanReport,
};

use std::ops::ControlFlow;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension as _};

use crate::filters::ResourceFilter;
use crate::{Result, Sha256Digest};

/// Busy timeout applied to every resource-table connection.
const DB_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(16);

/// One row of `rst_manifest`.
///
/// A row without a filter is a leaf: its logical bytes equal the blob
/// named by `digest`. A filtered row is derived from other rows.
#[derive(Debug, Clone)]
pub struct ResourceRow {
    /// Primary key.
    pub resource_id: i64,
    /// Digest of the reconstructed logical content.
    pub digest: Sha256Digest,
    /// Logical content size.
    pub size: u64,
    /// Derivation rule, `None` for leaves.
    pub filter: Option<ResourceFilter>,
    /// Opaque per-resource metadata.
    pub meta: Option<Vec<u8>>,
}

impl ResourceRow {
    /// Returns `true` when this row is a leaf resource.
    pub fn is_leaf(&self) -> bool {
        self.filter.is_none()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rst_manifest (
    resource_id INTEGER PRIMARY KEY,
    digest BLOB NOT NULL,
    size INTEGER NOT NULL,
    filter_applied BLOB,
    meta BLOB
);
CREATE INDEX IF NOT EXISTS rst_digest_index ON rst_manifest(digest);
";

/// An open resource-table database.
///
/// Connections are cheap; worker threads each open their own.
#[derive(Debug)]
pub struct ResourceTable {
    conn: Connection,
}

impl ResourceTable {
    /// Creates (or opens) a resource-table database, bootstrapping the schema.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(DB_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Opens an existing resource-table database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(DB_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Inserts a resource row, returning its id.
    pub fn insert(
        &self,
        digest: &Sha256Digest,
        size: u64,
        filter: Option<&ResourceFilter>,
        meta: Option<&[u8]>,
    ) -> Result<i64> {
        let filter_blob = filter.map(ResourceFilter::to_bytes).transpose()?;
        self.conn.execute(
            "INSERT INTO rst_manifest (digest, size, filter_applied, meta) VALUES (?1, ?2, ?3, ?4)",
            params![digest, size, filter_blob, meta],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Sha256Digest, u64, Option<Vec<u8>>, Option<Vec<u8>>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn materialize(
        raw: (i64, Sha256Digest, u64, Option<Vec<u8>>, Option<Vec<u8>>),
    ) -> Result<ResourceRow> {
        let (resource_id, digest, size, filter_blob, meta) = raw;
        Ok(ResourceRow {
            resource_id,
            digest,
            size,
            filter: filter_blob
                .as_deref()
                .map(ResourceFilter::from_bytes)
                .transpose()?,
            meta,
        })
    }

    /// Looks a resource up by digest.
    pub fn get_by_digest(&self, digest: &Sha256Digest) -> Result<Option<ResourceRow>> {
        self.conn
            .query_row(
                "SELECT resource_id, digest, size, filter_applied, meta \
                 FROM rst_manifest WHERE digest = ?1",
                params![digest],
                Self::row_from,
            )
            .optional()?
            .map(Self::materialize)
            .transpose()
    }

    /// Looks a resource up by id.
    pub fn get_by_id(&self, resource_id: i64) -> Result<Option<ResourceRow>> {
        self.conn
            .query_row(
                "SELECT resource_id, digest, size, filter_applied, meta \
                 FROM rst_manifest WHERE resource_id = ?1",
                params![resource_id],
                Self::row_from,
            )
            .optional()?
            .map(Self::materialize)
            .transpose()
    }

    /// Returns `true` if a row with the given id exists.
    pub fn contains_id(&self, resource_id: i64) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM rst_manifest WHERE resource_id = ?1",
                params![resource_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Counts the rows in the table.
    pub fn count(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM rst_manifest", [], |row| row.get(0))?)
    }

    /// Streams every row.
    pub fn for_each(
        &self,
        mut f: impl FnMut(ResourceRow) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_id, digest, size, filter_applied, meta FROM rst_manifest",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let materialized = Self::materialize(Self::row_from(row)?)?;
            if f(materialized)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}
