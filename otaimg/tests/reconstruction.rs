//! Reconstruction-engine behavior over slice + compress filter graphs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use otaimg::digest::file_sha256;
use otaimg::filters::ResourceFilter;
use otaimg::rst::{scan_download_dir, ResourceDownloadInfo, ResourcePreparer, ResourceTable};
use otaimg::{Error, Sha256Digest};

/// Deterministic incompressible-ish bytes (xorshift).
fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

struct Fixture {
    _tmp: tempfile::TempDir,
    rst_path: PathBuf,
    resource_dir: PathBuf,
    download_dir: PathBuf,
    blobs: HashMap<Sha256Digest, Vec<u8>>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self {
            rst_path: tmp.path().join("rst.sqlite3"),
            resource_dir: tmp.path().join("resources"),
            download_dir: tmp.path().join("staging"),
            blobs: HashMap::new(),
            _tmp: tmp,
        }
    }

    fn add_blob(&mut self, contents: Vec<u8>) -> Sha256Digest {
        let digest = Sha256Digest::of(&contents);
        self.blobs.insert(digest, contents);
        digest
    }

    /// An honest fulfiller serving raw blobs from the in-memory map.
    fn fetch(&self, log: &mut Vec<ResourceDownloadInfo>, info: &ResourceDownloadInfo) {
        log.push(info.clone());
        let raw = self.blobs.get(&info.digest).expect("unknown blob requested");
        if info.compression_alg.is_some() {
            fs::write(&info.save_dst, zstd::decode_all(raw.as_slice()).unwrap()).unwrap();
        } else {
            fs::write(&info.save_dst, raw).unwrap();
        }
    }
}

/// Logical content L, stored as two slices of zstd(L), re-expanded via a
/// compress node over the slice node.
#[test]
fn slice_plus_compress_reconstruction() {
    let mut fx = Fixture::new();
    let logical = pseudo_random(200_000, 0x5eed);
    let logical_digest = Sha256Digest::of(&logical);

    let compressed = zstd::encode_all(logical.as_slice(), 3).unwrap();
    let split = compressed.len() / 2;
    let (front, back) = compressed.split_at(split);

    let rst = ResourceTable::create(&fx.rst_path).unwrap();
    let front_digest = fx.add_blob(front.to_vec());
    let back_digest = fx.add_blob(back.to_vec());
    let front_id = rst.insert(&front_digest, front.len() as u64, None, None).unwrap();
    let back_id = rst.insert(&back_digest, back.len() as u64, None, None).unwrap();

    let sliced_digest = Sha256Digest::of(&compressed);
    let sliced_id = rst
        .insert(
            &sliced_digest,
            compressed.len() as u64,
            Some(&ResourceFilter::Slice {
                slices: vec![front_id, back_id],
            }),
            None,
        )
        .unwrap();
    rst.insert(
        &logical_digest,
        logical.len() as u64,
        Some(&ResourceFilter::Compress {
            resource_id: sliced_id,
            compression_alg: "zstd".to_owned(),
        }),
        None,
    )
    .unwrap();

    let preparer = ResourcePreparer::new(&fx.resource_dir, &fx.download_dir).unwrap();
    let mut plan = Vec::new();
    let out = preparer
        .prepare(&rst, &logical_digest, &mut |info| {
            fx.fetch(&mut plan, info);
            Ok(())
        })
        .unwrap();

    // the plan asked for exactly the two slice leaves, uncompressed
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|info| info.compression_alg.is_none()));
    assert_eq!(file_sha256(&out).unwrap(), logical_digest);
}

/// A compressed leaf is delegated to the caller as a streamed decompression.
#[test]
fn compressed_leaf_is_decompressed_by_the_caller() {
    let mut fx = Fixture::new();
    let logical = pseudo_random(50_000, 42);
    let logical_digest = Sha256Digest::of(&logical);
    let compressed = zstd::encode_all(logical.as_slice(), 3).unwrap();

    let rst = ResourceTable::create(&fx.rst_path).unwrap();
    let compressed_digest = fx.add_blob(compressed.clone());
    let leaf_id = rst
        .insert(&compressed_digest, compressed.len() as u64, None, None)
        .unwrap();
    rst.insert(
        &logical_digest,
        logical.len() as u64,
        Some(&ResourceFilter::Compress {
            resource_id: leaf_id,
            compression_alg: "zstd".to_owned(),
        }),
        None,
    )
    .unwrap();

    let preparer = ResourcePreparer::new(&fx.resource_dir, &fx.download_dir).unwrap();
    let mut plan = Vec::new();
    let out = preparer
        .prepare(&rst, &logical_digest, &mut |info| {
            fx.fetch(&mut plan, info);
            Ok(())
        })
        .unwrap();

    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].compression_alg.as_deref(), Some("zstd"));
    assert_eq!(plan[0].compressed_origin_digest, Some(logical_digest));
    assert_eq!(plan[0].compressed_origin_size, Some(logical.len() as u64));
    assert_eq!(file_sha256(&out).unwrap(), logical_digest);
}

/// Re-running prepare on a populated resource dir is a no-op.
#[test]
fn prepare_is_idempotent() {
    let mut fx = Fixture::new();
    let payload = pseudo_random(4096, 7);
    let digest = fx.add_blob(payload);

    let rst = ResourceTable::create(&fx.rst_path).unwrap();
    rst.insert(&digest, 4096, None, None).unwrap();

    let preparer = ResourcePreparer::new(&fx.resource_dir, &fx.download_dir).unwrap();
    let mut first_plan = Vec::new();
    preparer
        .prepare(&rst, &digest, &mut |info| {
            fx.fetch(&mut first_plan, info);
            Ok(())
        })
        .unwrap();
    assert_eq!(first_plan.len(), 1);

    let mut second_plan = Vec::new();
    preparer
        .prepare(&rst, &digest, &mut |info| {
            fx.fetch(&mut second_plan, info);
            Ok(())
        })
        .unwrap();
    assert!(second_plan.is_empty());
}

/// Slice referents must be leaves.
#[test]
fn derived_slice_referent_is_rejected() {
    let mut fx = Fixture::new();
    let payload = pseudo_random(1024, 9);
    let leaf_digest = fx.add_blob(payload);

    let rst = ResourceTable::create(&fx.rst_path).unwrap();
    let leaf_id = rst.insert(&leaf_digest, 1024, None, None).unwrap();
    let derived_id = rst
        .insert(
            &Sha256Digest::of(b"derived"),
            512,
            Some(&ResourceFilter::Bundle {
                bundle_resource_id: leaf_id,
                offset: 0,
                len: 512,
            }),
            None,
        )
        .unwrap();
    let bad_digest = Sha256Digest::of(b"bad-slice");
    rst.insert(
        &bad_digest,
        512,
        Some(&ResourceFilter::Slice {
            slices: vec![derived_id],
        }),
        None,
    )
    .unwrap();

    let preparer = ResourcePreparer::new(&fx.resource_dir, &fx.download_dir).unwrap();
    let err = preparer
        .prepare(&rst, &bad_digest, &mut |info| {
            fx.fetch(&mut Vec::new(), info);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::SlicedRecreateFailed { .. }));
}

/// Interrupted staging directories are cleaned conservatively.
#[test]
fn resumed_staging_dir_keeps_verified_partials() {
    let mut fx = Fixture::new();
    let payload = pseudo_random(2048, 11);
    let digest = fx.add_blob(payload.clone());

    let rst = ResourceTable::create(&fx.rst_path).unwrap();
    let id = rst.insert(&digest, 2048, None, None).unwrap();

    fs::create_dir_all(&fx.download_dir).unwrap();
    // a good slice partial and a truncated (corrupt) one
    fs::write(
        fx.download_dir.join(format!("{}_{id}", digest.hex())),
        &payload,
    )
    .unwrap();
    fs::write(fx.download_dir.join(digest.hex()), &payload[..100]).unwrap();
    fs::write(fx.download_dir.join("tmp_fetch_00c0ffee"), b"junk").unwrap();

    let report = scan_download_dir(&rst, &fx.download_dir).unwrap();
    assert_eq!(report.kept, 1);
    assert_eq!(report.removed, 2);
}
