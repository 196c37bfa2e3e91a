//! Concurrent verification of the blobs backing an image.

use std::io::Read as _;
use std::sync::{mpsc, Mutex};
use std::thread;

use sha2::{Digest as _, Sha256};
use tracing::info;

use crate::artifact::ImageSource;
use crate::digest::HASH_READ_SIZE;
use crate::util::{FailLatch, Semaphore};
use crate::{Error, Result, Sha256Digest};

/// Hashes blobs of an image and compares them to their declared digests.
///
/// With `digests` given, only those blobs are checked; otherwise the
/// whole blob listing is. Workers hold one image reader and one scratch
/// buffer each. Returns the number of blobs verified; the first
/// mismatch or read failure aborts the run.
pub fn verify_image_blobs(
    source: &ImageSource,
    digests: Option<Vec<Sha256Digest>>,
    workers: usize,
) -> Result<u64> {
    let to_check = match digests {
        Some(digests) => digests,
        None => source.open()?.list_blobs()?,
    };

    let workers = workers.max(1);
    let sem = Semaphore::new(workers * 6);
    let latch = FailLatch::new();
    let (tx, rx) = mpsc::channel::<Sha256Digest>();
    let rx = Mutex::new(rx);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let mut reader = match source.open() {
                    Ok(reader) => reader,
                    Err(e) => {
                        latch.set(e);
                        while rx.lock().unwrap_or_else(|p| p.into_inner()).recv().is_ok() {
                            sem.release();
                        }
                        return;
                    }
                };
                // one scratch buffer per hashing worker
                let mut buf = vec![0u8; HASH_READ_SIZE];
                loop {
                    let job = rx.lock().unwrap_or_else(|p| p.into_inner()).recv();
                    let Ok(expected) = job else { break };
                    let result = hash_one(&mut reader, &mut buf, &expected);
                    sem.release();
                    if let Err(e) = result {
                        latch.set(e);
                    }
                }
            });
        }

        for digest in &to_check {
            if latch.is_set() {
                break;
            }
            sem.acquire();
            if tx.send(*digest).is_err() {
                break;
            }
        }
        drop(tx);
    });

    match latch.take() {
        Some(e) => Err(e),
        None => {
            info!(count = to_check.len(), "blobs verified");
            Ok(to_check.len() as u64)
        }
    }
}

fn hash_one(
    reader: &mut crate::artifact::ImageReader,
    buf: &mut [u8],
    expected: &Sha256Digest,
) -> Result<()> {
    let mut blob = reader.open_blob(expected)?;
    let mut hasher = Sha256::new();
    loop {
        let n = blob.read(buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = Sha256Digest::new(hasher.finalize().into());
    if actual != *expected {
        return Err(Error::BadDigest {
            expected: expected.hex(),
            actual: actual.hex(),
        });
    }
    Ok(())
}
