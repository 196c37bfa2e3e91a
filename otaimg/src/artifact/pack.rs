//! Reproducible packing of an image directory into an artifact ZIP.

use std::fs;
use std::io::{self, BufWriter, Write as _};
use std::path::Path;

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::artifact::{DIR_PERMISSION, FILE_PERMISSION, MEMBER_TIMESTAMP};
use crate::consts::{IMAGE_INDEX_FNAME, INDEX_JWT_FNAME};
use crate::{Error, Result};

fn member_timestamp() -> Result<DateTime> {
    let (y, mo, d, h, mi, s) = MEMBER_TIMESTAMP;
    DateTime::from_date_and_time(y, mo, d, h, mi, s)
        .map_err(|_| Error::NotFound("invalid fixed member timestamp".to_owned()))
}

/// Packs the image at `image_root` into an artifact ZIP at `output`.
///
/// Member order: `index.json` first, `index.jwt` (when the image is
/// signed) second, the remaining top-level files in lexicographic order,
/// then each subdirectory with its contents in lexicographic order,
/// files before nested directories. Returns the number of file members
/// written.
pub fn pack_artifact(image_root: &Path, output: &Path) -> Result<u64> {
    let timestamp = member_timestamp();
    let timestamp = timestamp?;
    let file_opts: SimpleFileOptions = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(FILE_PERMISSION)
        .last_modified_time(timestamp)
        .large_file(true);
    let dir_opts: SimpleFileOptions = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(DIR_PERMISSION)
        .last_modified_time(timestamp);

    let mut zip = ZipWriter::new(BufWriter::new(fs::File::create(output)?));
    let mut file_count: u64 = 0;

    // index.json leads the archive, the JWS (if signed) follows.
    add_file(&mut zip, &image_root.join(IMAGE_INDEX_FNAME), IMAGE_INDEX_FNAME, file_opts)?;
    file_count += 1;
    let jwt = image_root.join(INDEX_JWT_FNAME);
    if jwt.is_file() {
        add_file(&mut zip, &jwt, INDEX_JWT_FNAME, file_opts)?;
        file_count += 1;
    }

    let (top_files, top_dirs) = sorted_entries(image_root)?;
    for name in &top_files {
        if name == IMAGE_INDEX_FNAME || name == INDEX_JWT_FNAME {
            continue;
        }
        add_file(&mut zip, &image_root.join(name), name, file_opts)?;
        file_count += 1;
    }
    for name in &top_dirs {
        file_count += add_dir_recursive(&mut zip, &image_root.join(name), name, file_opts, dir_opts)?;
    }

    let mut inner = zip.finish()?;
    inner.flush()?;
    debug!(members = file_count, output = %output.display(), "packed artifact");
    Ok(file_count)
}

fn sorted_entries(dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    files.sort();
    dirs.sort();
    Ok((files, dirs))
}

fn add_file(
    zip: &mut ZipWriter<BufWriter<fs::File>>,
    src: &Path,
    arcname: &str,
    opts: SimpleFileOptions,
) -> Result<()> {
    zip.start_file(arcname, opts)?;
    let mut reader = fs::File::open(src)?;
    io::copy(&mut reader, zip)?;
    Ok(())
}

fn add_dir_recursive(
    zip: &mut ZipWriter<BufWriter<fs::File>>,
    dir: &Path,
    arcname: &str,
    file_opts: SimpleFileOptions,
    dir_opts: SimpleFileOptions,
) -> Result<u64> {
    zip.add_directory(arcname, dir_opts)?;
    let mut count = 0;
    let (files, dirs) = sorted_entries(dir)?;
    for name in &files {
        add_file(zip, &dir.join(name), &format!("{arcname}/{name}"), file_opts)?;
        count += 1;
    }
    for name in &dirs {
        count +=
            add_dir_recursive(zip, &dir.join(name), &format!("{arcname}/{name}"), file_opts, dir_opts)?;
    }
    Ok(count)
}
