//! The file table: a relational description of a rootfs in SQLite.
//!
//! Five tables: `ft_inode` (ownership, mode, link count, xattrs),
//! `ft_regular`, `ft_non_regular`, `ft_dir` (each keyed by absolute
//! POSIX path), and `ft_resource` mapping `resource_id` to a digest,
//! size and optionally inlined contents for tiny files.

pub mod fs_ops;

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension as _};

use crate::consts::{FILE_TABLE_FNAME, MEDIA_TYPE_FNAME};
use crate::meta::media_types::OTA_IMAGE_FILETABLE;
use crate::{Error, Result, Sha256Digest};

/// Busy timeout applied to every file-table connection.
const DB_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(16);

/// Cap on paths reported per digest by the common-digest join.
pub const MAX_ENTRIES_PER_DIGEST: usize = 16;

/// Extended attributes of an inode, name to raw value.
pub type XattrMap = BTreeMap<String, Vec<u8>>;

/// Encodes an xattr map into its msgpack column form.
pub fn encode_xattrs(xattrs: &XattrMap) -> Result<Vec<u8>> {
    let view: BTreeMap<&str, &serde_bytes::Bytes> = xattrs
        .iter()
        .map(|(k, v)| (k.as_str(), serde_bytes::Bytes::new(v)))
        .collect();
    Ok(rmp_serde::to_vec(&view)?)
}

/// Decodes the msgpack column form of an xattr map.
pub fn decode_xattrs(raw: &[u8]) -> Result<XattrMap> {
    let decoded: BTreeMap<String, serde_bytes::ByteBuf> = rmp_serde::from_slice(raw)?;
    Ok(decoded
        .into_iter()
        .map(|(k, v)| (k, v.into_vec()))
        .collect())
}

/// A directory row joined with its inode.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Absolute canonical path.
    pub path: String,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode bits including the file-type part.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: Option<XattrMap>,
}

/// A non-regular file row (symlink or char device) joined with its inode.
#[derive(Debug, Clone)]
pub struct NonRegularEntry {
    /// Absolute canonical path.
    pub path: String,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode bits including the file-type part.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: Option<XattrMap>,
    /// Symlink target bytes; unused for char devices.
    pub meta: Option<Vec<u8>>,
}

/// A regular file row joined with its inode and resource.
#[derive(Debug, Clone)]
pub struct RegularEntry {
    /// Absolute canonical path.
    pub path: String,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full mode bits including the file-type part.
    pub mode: u32,
    /// Hardlink count; entries over 1 share an inode group.
    pub links_count: Option<u64>,
    /// Extended attributes.
    pub xattrs: Option<XattrMap>,
    /// Content digest.
    pub digest: Sha256Digest,
    /// Logical file size.
    pub size: u64,
    /// Inode id, the hardlink group key.
    pub inode_id: i64,
    /// Inlined file bytes, when the content lives inside the table.
    pub contents: Option<Vec<u8>>,
}

impl RegularEntry {
    /// An entry is inlined when it carries contents or is empty.
    pub fn is_inlined(&self) -> bool {
        self.contents.is_some() || self.size == 0
    }
}

/// Rootfs statistics derived from a populated file table.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct FileTableStats {
    /// Count of regular file rows.
    pub regular_files_count: u64,
    /// Count of non-regular file rows.
    pub non_regular_files_count: u64,
    /// Count of directory rows.
    pub dirs_count: u64,
    /// Count of unique file entries (distinct digests).
    pub unique_file_entries: u64,
    /// Total size of unique file entries.
    pub unique_file_entries_size: u64,
    /// Total rootfs size over all regular files.
    pub rootfs_size: u64,
}

/// An open file-table database.
#[derive(Debug)]
pub struct FileTable {
    conn: Connection,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ft_inode (
    inode_id INTEGER PRIMARY KEY,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    links_count INTEGER,
    xattrs BLOB
);
CREATE TABLE IF NOT EXISTS ft_regular (
    path TEXT PRIMARY KEY,
    inode_id INTEGER NOT NULL,
    resource_id INTEGER
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ft_non_regular (
    path TEXT PRIMARY KEY,
    inode_id INTEGER NOT NULL,
    meta BLOB
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ft_dir (
    path TEXT PRIMARY KEY,
    inode_id INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ft_resource (
    resource_id INTEGER PRIMARY KEY,
    digest BLOB NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    contents BLOB
);
CREATE INDEX IF NOT EXISTS fr_resource_id_index ON ft_regular(resource_id);
CREATE INDEX IF NOT EXISTS fr_inode_id_index ON ft_regular(inode_id);
CREATE INDEX IF NOT EXISTS fnr_inode_id_index ON ft_non_regular(inode_id);
CREATE INDEX IF NOT EXISTS fd_inode_id_index ON ft_dir(inode_id);
";

impl FileTable {
    /// Creates (or opens) a file-table database, bootstrapping the schema.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(DB_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Opens an existing file-table database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn =
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(DB_TIMEOUT)?;
        Ok(Self { conn })
    }

    //
    // ------ authoring ------ //
    //

    /// Inserts an inode row, returning its id.
    pub fn insert_inode(
        &self,
        uid: u32,
        gid: u32,
        mode: u32,
        links_count: Option<u64>,
        xattrs: Option<&XattrMap>,
    ) -> Result<i64> {
        let xattrs_blob = xattrs.map(encode_xattrs).transpose()?;
        self.conn.execute(
            "INSERT INTO ft_inode (uid, gid, mode, links_count, xattrs) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uid, gid, mode, links_count, xattrs_blob],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Inserts (or finds) a file resource row by digest, returning its id.
    pub fn insert_file_resource(
        &self,
        digest: &Sha256Digest,
        size: u64,
        contents: Option<&[u8]>,
    ) -> Result<i64> {
        if let Some(existing) = self
            .conn
            .query_row(
                "SELECT resource_id FROM ft_resource WHERE digest = ?1",
                params![digest],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(existing);
        }
        self.conn.execute(
            "INSERT INTO ft_resource (digest, size, contents) VALUES (?1, ?2, ?3)",
            params![digest, size, contents],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Inserts a regular file row.
    pub fn insert_regular(&self, path: &str, inode_id: i64, resource_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ft_regular (path, inode_id, resource_id) VALUES (?1, ?2, ?3)",
            params![path, inode_id, resource_id],
        )?;
        Ok(())
    }

    /// Inserts a directory row.
    pub fn insert_dir(&self, path: &str, inode_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ft_dir (path, inode_id) VALUES (?1, ?2)",
            params![path, inode_id],
        )?;
        Ok(())
    }

    /// Inserts a non-regular file row.
    pub fn insert_non_regular(&self, path: &str, inode_id: i64, meta: Option<&[u8]>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ft_non_regular (path, inode_id, meta) VALUES (?1, ?2, ?3)",
            params![path, inode_id, meta],
        )?;
        Ok(())
    }

    //
    // ------ iteration ------ //
    //

    /// Streams every directory entry.
    pub fn for_each_dir(&self, mut f: impl FnMut(DirEntry) -> Result<()>) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT path, uid, gid, mode, xattrs FROM ft_dir JOIN ft_inode USING (inode_id)",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let xattrs: Option<Vec<u8>> = row.get(4)?;
            f(DirEntry {
                path: row.get(0)?,
                uid: row.get(1)?,
                gid: row.get(2)?,
                mode: row.get(3)?,
                xattrs: xattrs.as_deref().map(decode_xattrs).transpose()?,
            })?;
        }
        Ok(())
    }

    /// Streams every non-regular entry.
    pub fn for_each_non_regular(
        &self,
        mut f: impl FnMut(NonRegularEntry) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT path, uid, gid, mode, xattrs, meta \
             FROM ft_non_regular JOIN ft_inode USING (inode_id)",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let xattrs: Option<Vec<u8>> = row.get(4)?;
            f(NonRegularEntry {
                path: row.get(0)?,
                uid: row.get(1)?,
                gid: row.get(2)?,
                mode: row.get(3)?,
                xattrs: xattrs.as_deref().map(decode_xattrs).transpose()?,
                meta: row.get(5)?,
            })?;
        }
        Ok(())
    }

    /// Streams every regular entry in digest order.
    ///
    /// Digest ordering is what the deployer's hardlink-group logic relies
    /// on; the closure may stop the walk early by returning `Break`.
    pub fn for_each_regular(
        &self,
        mut f: impl FnMut(RegularEntry) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT path, uid, gid, mode, links_count, xattrs, digest, size, contents, inode_id \
             FROM ft_regular \
             JOIN ft_inode USING (inode_id) \
             JOIN ft_resource USING (resource_id) \
             ORDER BY digest",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let xattrs: Option<Vec<u8>> = row.get(5)?;
            let entry = RegularEntry {
                path: row.get(0)?,
                uid: row.get(1)?,
                gid: row.get(2)?,
                mode: row.get(3)?,
                links_count: row.get(4)?,
                xattrs: xattrs.as_deref().map(decode_xattrs).transpose()?,
                digest: row.get(6)?,
                size: row.get(7)?,
                contents: row.get(8)?,
                inode_id: row.get(9)?,
            };
            if f(entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Streams the distinct non-inlined resources as `(digest, size)`.
    ///
    /// Inlined entries and empty files never hit the resource layer, so
    /// they are excluded.
    pub fn for_each_unique_resource(
        &self,
        mut f: impl FnMut(Sha256Digest, u64) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT digest, size FROM ft_resource WHERE contents IS NULL AND size > 0",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if f(row.get(0)?, row.get(1)?)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Streams digests common to this table and a base file table.
    ///
    /// Joins the base table in via `ATTACH`; per digest, reports up to
    /// `max_per_digest` paths from the base table. The empty-file digest
    /// and entries inlined in this table are skipped.
    pub fn for_each_common_digest(
        &self,
        base_file_table: &Path,
        max_per_digest: usize,
        mut f: impl FnMut(Sha256Digest, Vec<PathBuf>) -> Result<()>,
    ) -> Result<()> {
        let base = base_file_table.to_string_lossy();
        self.conn
            .execute("ATTACH DATABASE ?1 AS base", params![base.as_ref()])?;
        let result = (|| {
            let mut stmt = self.conn.prepare(
                "SELECT base.ft_regular.path, base.ft_resource.digest \
                 FROM base.ft_regular \
                 JOIN base.ft_resource USING (resource_id) \
                 JOIN ft_resource AS target_rs ON base.ft_resource.digest = target_rs.digest \
                 WHERE base.ft_resource.digest != ?1 AND target_rs.contents IS NULL \
                 ORDER BY base.ft_resource.digest",
            )?;
            let mut rows = stmt.query(params![Sha256Digest::EMPTY])?;

            let mut current: Option<(Sha256Digest, Vec<PathBuf>)> = None;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                let digest: Sha256Digest = row.get(1)?;
                match &mut current {
                    Some((cur, paths)) if *cur == digest => {
                        // over-popular digests are capped to bound memory
                        if paths.len() < max_per_digest {
                            paths.push(PathBuf::from(path));
                        }
                    }
                    _ => {
                        if let Some((done, paths)) = current.take() {
                            f(done, paths)?;
                        }
                        current = Some((digest, vec![PathBuf::from(path)]));
                    }
                }
            }
            if let Some((done, paths)) = current.take() {
                f(done, paths)?;
            }
            Ok(())
        })();
        self.conn.execute("DETACH DATABASE base", [])?;
        result
    }

    /// Computes rootfs statistics for the image config labels.
    pub fn stats(&self) -> Result<FileTableStats> {
        let one = |sql: &str| -> Result<u64> {
            Ok(self
                .conn
                .query_row(sql, [], |row| row.get::<_, Option<u64>>(0))?
                .unwrap_or(0))
        };
        Ok(FileTableStats {
            regular_files_count: one("SELECT COUNT(*) FROM ft_regular")?,
            non_regular_files_count: one("SELECT COUNT(*) FROM ft_non_regular")?,
            dirs_count: one("SELECT COUNT(*) FROM ft_dir")?,
            unique_file_entries: one("SELECT COUNT(*) FROM ft_resource")?,
            unique_file_entries_size: one("SELECT SUM(size) FROM ft_resource")?,
            rootfs_size: one(
                "SELECT SUM(ft_resource.size) FROM ft_regular \
                 JOIN ft_resource USING (resource_id)",
            )?,
        })
    }

    //
    // ------ save / load protocol ------ //
    //
    // A file table saved to a directory is laid out as:
    //   <dst>/
    //       ├── file_table.sqlite3
    //       └── mediaType

    /// Saves this file table into `dst_dir` with the image-meta layout.
    pub fn save_to_dir(&self, dst_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dst_dir)?;
        let db_path = dst_dir.join(FILE_TABLE_FNAME);
        self.conn
            .execute("VACUUM INTO ?1", params![db_path.to_string_lossy().as_ref()])?;
        std::fs::write(dst_dir.join(MEDIA_TYPE_FNAME), OTA_IMAGE_FILETABLE)?;
        Ok(db_path)
    }

    /// Finds and validates a saved file table under `image_meta_dir`.
    pub fn find_saved(image_meta_dir: &Path) -> Result<PathBuf> {
        let media_type_file = image_meta_dir.join(MEDIA_TYPE_FNAME);
        let media_type = std::fs::read_to_string(&media_type_file)
            .map_err(|_| Error::NotFound(format!("{} not found", media_type_file.display())))?;
        if media_type != OTA_IMAGE_FILETABLE {
            return Err(Error::BadMediaType(media_type));
        }
        let db_path = image_meta_dir.join(FILE_TABLE_FNAME);
        if !db_path.is_file() {
            return Err(Error::NotFound(format!("{} not found", db_path.display())));
        }
        check_base_file_table(&db_path)?;
        Ok(db_path)
    }
}

/// Validates a base file table: integrity, required tables, attachability.
pub fn check_base_file_table(db_path: &Path) -> Result<()> {
    let uri = format!("file:{}?mode=ro&immutable=1", db_path.display());
    let conn = Connection::open_with_flags(
        &uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?;
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if integrity != "ok" {
        return Err(Error::NotFound(format!(
            "{} fails integrity check: {integrity}",
            db_path.display()
        )));
    }
    for table in ["ft_regular", "ft_resource"] {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(Error::NotFound(format!(
                "{} lacks required table {table}",
                db_path.display()
            )));
        }
    }
    drop(conn);

    let probe = Connection::open_in_memory()?;
    probe.execute(
        "ATTACH DATABASE ?1 AS attach_test",
        params![db_path.to_string_lossy().as_ref()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table(dir: &Path) -> FileTable {
        let ft = FileTable::create(&dir.join("ft.sqlite3")).unwrap();
        let root_inode = ft.insert_inode(0, 0, 0o040755, None, None).unwrap();
        ft.insert_dir("/", root_inode).unwrap();

        let rs_a = ft
            .insert_file_resource(&Sha256Digest::of(b"content-a"), 9, None)
            .unwrap();
        let inode_a = ft.insert_inode(0, 0, 0o100644, None, None).unwrap();
        ft.insert_regular("/a", inode_a, rs_a).unwrap();

        // hardlinked pair sharing one inode
        let rs_b = ft
            .insert_file_resource(&Sha256Digest::of(b"content-b"), 9, None)
            .unwrap();
        let inode_b = ft.insert_inode(0, 0, 0o100644, Some(2), None).unwrap();
        ft.insert_regular("/b1", inode_b, rs_b).unwrap();
        ft.insert_regular("/b2", inode_b, rs_b).unwrap();

        // inlined tiny file
        let rs_tiny = ft
            .insert_file_resource(&Sha256Digest::of(b"hi"), 2, Some(b"hi"))
            .unwrap();
        let inode_tiny = ft.insert_inode(0, 0, 0o100600, None, None).unwrap();
        ft.insert_regular("/tiny", inode_tiny, rs_tiny).unwrap();

        let inode_link = ft.insert_inode(0, 0, 0o120777, None, None).unwrap();
        ft.insert_non_regular("/link", inode_link, Some(b"/a")).unwrap();
        ft
    }

    #[test]
    fn regular_walk_is_digest_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let ft = sample_table(dir.path());
        let mut digests = Vec::new();
        ft.for_each_regular(|entry| {
            digests.push(entry.digest);
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        assert_eq!(digests.len(), 4);
        let mut sorted = digests.clone();
        sorted.sort();
        assert_eq!(digests, sorted);
    }

    #[test]
    fn unique_resources_exclude_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let ft = sample_table(dir.path());
        let mut seen = Vec::new();
        ft.for_each_unique_resource(|digest, size| {
            seen.push((digest, size));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen.iter().any(|(d, _)| *d == Sha256Digest::of(b"hi")));
    }

    #[test]
    fn stats_reflect_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ft = sample_table(dir.path());
        let stats = ft.stats().unwrap();
        assert_eq!(stats.regular_files_count, 4);
        assert_eq!(stats.dirs_count, 1);
        assert_eq!(stats.non_regular_files_count, 1);
        assert_eq!(stats.unique_file_entries, 3);
        // /a 9 + /b1 9 + /b2 9 + /tiny 2
        assert_eq!(stats.rootfs_size, 29);
    }

    #[test]
    fn xattr_codec_roundtrip() {
        let mut map = XattrMap::new();
        map.insert("user.test".to_owned(), b"value".to_vec());
        map.insert("security.selinux".to_owned(), b"ctx\0".to_vec());
        let raw = encode_xattrs(&map).unwrap();
        assert_eq!(decode_xattrs(&raw).unwrap(), map);
    }

    #[test]
    fn common_digest_join_skips_inlined_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ft = sample_table(dir.path());

        // base table shares /a's digest, adds an unrelated one
        let base_dir = tempfile::tempdir().unwrap();
        let base = FileTable::create(&base_dir.path().join("ft.sqlite3")).unwrap();
        let rs = base
            .insert_file_resource(&Sha256Digest::of(b"content-a"), 9, None)
            .unwrap();
        let inode = base.insert_inode(0, 0, 0o100644, None, None).unwrap();
        base.insert_regular("/old/a", inode, rs).unwrap();
        let rs2 = base
            .insert_file_resource(&Sha256Digest::of(b"only-in-base"), 12, None)
            .unwrap();
        let inode2 = base.insert_inode(0, 0, 0o100644, None, None).unwrap();
        base.insert_regular("/old/z", inode2, rs2).unwrap();
        drop(base);

        let mut seen = Vec::new();
        ft.for_each_common_digest(
            &base_dir.path().join("ft.sqlite3"),
            MAX_ENTRIES_PER_DIGEST,
            |digest, paths| {
                seen.push((digest, paths));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Sha256Digest::of(b"content-a"));
        assert_eq!(seen[0].1, vec![PathBuf::from("/old/a")]);
    }

    #[test]
    fn save_and_find_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ft = sample_table(dir.path());
        let meta_dir = dir.path().join("meta");
        ft.save_to_dir(&meta_dir).unwrap();
        let found = FileTable::find_saved(&meta_dir).unwrap();
        let reopened = FileTable::open(&found).unwrap();
        assert_eq!(reopened.stats().unwrap().regular_files_count, 4);
    }
}
