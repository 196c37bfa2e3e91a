//! Artifact container reproducibility and reader behavior.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use otaimg::artifact::{pack_artifact, ArtifactReader, ImageSource};
use otaimg::layout::ImageDir;
use otaimg::{Error, Sha256Digest};

fn build_small_image(root: &Path) -> ImageDir {
    let image = ImageDir::init(root, "0.3.0").unwrap();
    let store = image.blob_store();
    store.put_bytes(b"blob one").unwrap();
    store.put_bytes(b"blob two, a little longer").unwrap();
    let mut index = image.load_index().unwrap();
    let (count, size) = image.blob_totals().unwrap();
    index.finalize(count, size).unwrap();
    image.write_index(&index).unwrap();
    image
}

#[test]
fn packing_twice_yields_identical_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let image_root = tmp.path().join("image");
    build_small_image(&image_root);

    let first = tmp.path().join("a.zip");
    let second = tmp.path().join("b.zip");
    pack_artifact(&image_root, &first).unwrap();
    pack_artifact(&image_root, &second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn source_permission_changes_do_not_leak_into_the_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let image_root = tmp.path().join("image");
    let image = build_small_image(&image_root);

    let first = tmp.path().join("a.zip");
    pack_artifact(&image_root, &first).unwrap();

    // member permissions are fixed by the format, not taken from disk
    for entry in fs::read_dir(image.resource_dir()).unwrap() {
        let path = entry.unwrap().path();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
    }
    let second = tmp.path().join("b.zip");
    pack_artifact(&image_root, &second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn index_is_the_first_member() {
    let tmp = tempfile::tempdir().unwrap();
    let image_root = tmp.path().join("image");
    build_small_image(&image_root);
    let artifact = tmp.path().join("image.zip");
    pack_artifact(&image_root, &artifact).unwrap();

    let archive = zip::ZipArchive::new(fs::File::open(&artifact).unwrap()).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert_eq!(names.first().copied(), Some("index.json"));
}

#[test]
fn reader_opens_blobs_without_extraction() {
    let tmp = tempfile::tempdir().unwrap();
    let image_root = tmp.path().join("image");
    let image = build_small_image(&image_root);
    let (digest, _) = image.blob_store().put_bytes(b"blob one").unwrap();

    let artifact = tmp.path().join("image.zip");
    pack_artifact(&image_root, &artifact).unwrap();

    let mut reader = ArtifactReader::open(&artifact).unwrap();
    assert!(reader.is_valid_image());
    assert_eq!(reader.read_blob(&digest).unwrap(), b"blob one");

    let missing = Sha256Digest::of(b"never added");
    assert!(matches!(
        reader.read_blob(&missing),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn both_image_forms_parse_to_the_same_index() {
    let tmp = tempfile::tempdir().unwrap();
    let image_root = tmp.path().join("image");
    build_small_image(&image_root);
    let artifact = tmp.path().join("image.zip");
    pack_artifact(&image_root, &artifact).unwrap();

    let from_dir = ImageSource::detect(&image_root)
        .unwrap()
        .open()
        .unwrap()
        .parse_index()
        .unwrap();
    let from_zip = ImageSource::detect(&artifact)
        .unwrap()
        .open()
        .unwrap()
        .parse_index()
        .unwrap();
    assert_eq!(from_dir, from_zip);
}
