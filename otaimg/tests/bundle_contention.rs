//! Bundle exclusivity: many workers drawing from one bundle perform
//! exactly one bundle materialization.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use otaimg::digest::file_sha256;
use otaimg::filters::ResourceFilter;
use otaimg::rst::{ResourcePreparer, ResourceTable};
use otaimg::Sha256Digest;

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

const WINDOW: usize = 16 * 1024;
const CONSUMERS: usize = 64;

#[test]
fn concurrent_consumers_download_the_bundle_once() {
    let tmp = tempfile::tempdir().unwrap();
    let rst_path = tmp.path().join("rst.sqlite3");
    let resource_dir = tmp.path().join("resources");
    let download_dir = tmp.path().join("staging");

    let bundle = pseudo_random(1024 * 1024, 0xb00f);
    let bundle_digest = Sha256Digest::of(&bundle);

    let rst = ResourceTable::create(&rst_path).unwrap();
    let bundle_id = rst
        .insert(&bundle_digest, bundle.len() as u64, None, None)
        .unwrap();

    let mut targets = Vec::with_capacity(CONSUMERS);
    for i in 0..CONSUMERS {
        let offset = i * WINDOW;
        let window = &bundle[offset..offset + WINDOW];
        let digest = Sha256Digest::of(window);
        rst.insert(
            &digest,
            WINDOW as u64,
            Some(&ResourceFilter::Bundle {
                bundle_resource_id: bundle_id,
                offset: offset as u64,
                len: WINDOW as u64,
            }),
            None,
        )
        .unwrap();
        targets.push(digest);
    }
    drop(rst);

    let mut blobs = HashMap::new();
    blobs.insert(bundle_digest, bundle);

    let preparer = ResourcePreparer::new(&resource_dir, &download_dir).unwrap();
    let bundle_downloads = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for target in &targets {
            let preparer = &preparer;
            let blobs = &blobs;
            let bundle_downloads = &bundle_downloads;
            let rst_path = &rst_path;
            scope.spawn(move || {
                let rt = ResourceTable::open(rst_path).unwrap();
                preparer
                    .prepare(&rt, target, &mut |info| {
                        if info.digest == bundle_digest {
                            bundle_downloads.fetch_add(1, Ordering::SeqCst);
                        }
                        fs::write(&info.save_dst, blobs.get(&info.digest).unwrap())?;
                        Ok(())
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(bundle_downloads.load(Ordering::SeqCst), 1);
    for target in &targets {
        let path = resource_dir.join(target.hex());
        assert_eq!(file_sha256(&path).unwrap(), *target);
    }
}
