//! End-to-end deployment of a small image: artifact in, rootfs out.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;

use otaimg::artifact::{pack_artifact, ImageSource};
use otaimg::deploy::{deploy_resources, DeployOptions, DeploySetup, RootfsDeployer};
use otaimg::ft::FileTable;
use otaimg::layout::ImageDir;
use otaimg::meta::{
    export_metafile, media_types, ConfigLabels, Descriptor, ImageConfig, ImageIdentifier,
    ImageManifest, ManifestAnnotations, Metafile as _, ReleaseKey,
};
use otaimg::rst::ResourceTable;
use otaimg::Sha256Digest;

const FILE_A_CONTENT: &[u8] = b"hello\nworld\n\0";

struct BuiltImage {
    image_root: std::path::PathBuf,
}

/// Builds a directory-form image holding one payload:
/// `/a` (13 bytes), `/b` (hardlink to `/a`), `/c` (empty), `/d` (same
/// content as `/a`, independent inode), plus a symlink `/lnk -> /a`.
fn build_image(tmp: &Path) -> BuiltImage {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    let image_root = tmp.join("image");
    let image = ImageDir::init(&image_root, "0.3.0").unwrap();
    let store = image.blob_store();
    let workdir = tmp.join("build");
    fs::create_dir_all(&workdir).unwrap();

    let (content_digest, _) = store.put_bytes(FILE_A_CONTENT).unwrap();

    // resource table: one leaf
    let rst_path = workdir.join("resource_table.sqlite3");
    {
        let rst = ResourceTable::create(&rst_path).unwrap();
        rst.insert(&content_digest, FILE_A_CONTENT.len() as u64, None, None)
            .unwrap();
    }
    let (rst_digest, rst_size) = store
        .put_file(&rst_path, media_types::OTA_IMAGE_RESOURCETABLE_ZSTD, false)
        .unwrap();
    let rst_descriptor = Descriptor::new(
        media_types::OTA_IMAGE_RESOURCETABLE_ZSTD,
        rst_digest,
        rst_size,
    );

    // file table
    let ft_path = workdir.join("file_table.sqlite3");
    let stats = {
        let ft = FileTable::create(&ft_path).unwrap();
        let root_inode = ft.insert_inode(uid, gid, 0o040755, None, None).unwrap();
        ft.insert_dir("/", root_inode).unwrap();

        let content_rs = ft
            .insert_file_resource(&content_digest, FILE_A_CONTENT.len() as u64, None)
            .unwrap();
        let shared_inode = ft.insert_inode(uid, gid, 0o100644, Some(2), None).unwrap();
        ft.insert_regular("/a", shared_inode, content_rs).unwrap();
        ft.insert_regular("/b", shared_inode, content_rs).unwrap();

        let empty_rs = ft
            .insert_file_resource(&Sha256Digest::EMPTY, 0, None)
            .unwrap();
        let empty_inode = ft.insert_inode(uid, gid, 0o100644, None, None).unwrap();
        ft.insert_regular("/c", empty_inode, empty_rs).unwrap();

        let d_inode = ft.insert_inode(uid, gid, 0o100600, None, None).unwrap();
        ft.insert_regular("/d", d_inode, content_rs).unwrap();

        let lnk_inode = ft.insert_inode(uid, gid, 0o120777, None, None).unwrap();
        ft.insert_non_regular("/lnk", lnk_inode, Some(b"/a")).unwrap();

        ft.stats().unwrap()
    };
    let (ft_digest, ft_size) = store
        .put_file(&ft_path, media_types::OTA_IMAGE_FILETABLE_ZSTD, false)
        .unwrap();
    let ft_descriptor = Descriptor::new(media_types::OTA_IMAGE_FILETABLE_ZSTD, ft_digest, ft_size);

    // image config
    let config = ImageConfig {
        resource_digest_alg: "sha256".to_owned(),
        description: None,
        created: None,
        architecture: "arm64".to_owned(),
        os: Some("linux".to_owned()),
        os_version: None,
        sys_config: None,
        file_table: ft_descriptor.clone(),
        labels: ConfigLabels {
            base_image: "test-base".to_owned(),
            os: None,
            os_version: None,
            image_blobs_count: 3,
            image_blobs_size: 0,
            sys_image_size: Some(stats.rootfs_size),
            regular_files_count: stats.regular_files_count,
            non_regular_files_count: stats.non_regular_files_count,
            dirs_count: stats.dirs_count,
            unique_file_entries: stats.unique_file_entries,
            unique_file_entries_size: stats.unique_file_entries_size,
            extra: BTreeMap::new(),
        },
    };
    let config_descriptor = export_metafile(&store, &config).unwrap();

    // image manifest
    let manifest = ImageManifest {
        config: config_descriptor,
        layers: vec![ft_descriptor],
        annotations: ManifestAnnotations {
            ecu_id: "main".to_owned(),
            release_key: ReleaseKey::Dev,
            platform: None,
            hardware_model: "test-hw".to_owned(),
            hardware_series: None,
            arch: "arm64".to_owned(),
            extra: BTreeMap::new(),
        },
    };
    let manifest_bytes = manifest.to_bytes().unwrap();
    let (manifest_digest, manifest_size) = store.put_bytes(&manifest_bytes).unwrap();
    let manifest_descriptor = manifest.descriptor(manifest_digest, manifest_size).unwrap();

    // index: add payload, attach resource table, finalize
    let mut index = image.load_index().unwrap();
    index.add_image(manifest_descriptor).unwrap();
    index.update_resource_table(Some(rst_descriptor));
    let (count, size) = image.blob_totals().unwrap();
    index.finalize(count, size).unwrap();
    image.write_index(&index).unwrap();

    BuiltImage { image_root }
}

#[test]
fn deploy_small_image_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let built = build_image(tmp.path());

    let artifact = tmp.path().join("image.zip");
    pack_artifact(&built.image_root, &artifact).unwrap();

    let workdir = tmp.path().join("deploy-work");
    fs::create_dir_all(&workdir).unwrap();
    let source = ImageSource::detect(&artifact).unwrap();
    let image_id = ImageIdentifier::new("main", ReleaseKey::Dev);
    let setup = DeploySetup::new(source, &image_id, &workdir).unwrap();

    assert_eq!(setup.manifest.annotations.ecu_id, "main");
    assert_eq!(setup.config.labels.regular_files_count, 4);

    let opts = DeployOptions {
        workers: 4,
        concurrent: 16,
        read_size: 64 * 1024,
    };
    let resource_dir = tmp.path().join("resources");
    let staging_dir = tmp.path().join("staging");
    let (count, size) = deploy_resources(&setup, &resource_dir, &staging_dir, &opts).unwrap();
    assert_eq!(count, 1);
    assert_eq!(size, FILE_A_CONTENT.len() as u64);

    let rootfs = tmp.path().join("out");
    let ft = FileTable::open(&setup.ft_db).unwrap();
    RootfsDeployer::new(&rootfs, &resource_dir, &opts)
        .setup_rootfs(&ft)
        .unwrap();

    // contents
    assert_eq!(fs::read(rootfs.join("a")).unwrap(), FILE_A_CONTENT);
    assert_eq!(fs::read(rootfs.join("b")).unwrap(), FILE_A_CONTENT);
    assert_eq!(fs::read(rootfs.join("d")).unwrap(), FILE_A_CONTENT);
    assert_eq!(fs::read(rootfs.join("c")).unwrap(), b"");

    // hardlink group shares one inode; the independent copy does not
    let meta_a = fs::metadata(rootfs.join("a")).unwrap();
    let meta_b = fs::metadata(rootfs.join("b")).unwrap();
    let meta_d = fs::metadata(rootfs.join("d")).unwrap();
    assert_eq!(meta_a.ino(), meta_b.ino());
    assert_ne!(meta_a.ino(), meta_d.ino());
    assert!(meta_a.nlink() >= 2);

    // permissions applied per file-table rows
    assert_eq!(meta_a.mode() & 0o7777, 0o644);
    assert_eq!(meta_b.mode() & 0o7777, 0o644);
    assert_eq!(meta_d.mode() & 0o7777, 0o600);

    // symlink materialized with its target
    assert_eq!(
        fs::read_link(rootfs.join("lnk")).unwrap(),
        std::path::PathBuf::from("/a")
    );
}

#[test]
fn deploying_from_the_extracted_directory_matches_the_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let built = build_image(tmp.path());

    let workdir = tmp.path().join("deploy-work");
    fs::create_dir_all(&workdir).unwrap();
    let source = ImageSource::detect(&built.image_root).unwrap();
    let image_id = ImageIdentifier::new("main", ReleaseKey::Dev);
    let setup = DeploySetup::new(source, &image_id, &workdir).unwrap();

    let opts = DeployOptions {
        workers: 2,
        concurrent: 8,
        read_size: 64 * 1024,
    };
    let resource_dir = tmp.path().join("resources");
    let staging_dir = tmp.path().join("staging");
    deploy_resources(&setup, &resource_dir, &staging_dir, &opts).unwrap();

    let rootfs = tmp.path().join("out");
    let ft = FileTable::open(&setup.ft_db).unwrap();
    RootfsDeployer::new(&rootfs, &resource_dir, &opts)
        .setup_rootfs(&ft)
        .unwrap();
    assert_eq!(fs::read(rootfs.join("a")).unwrap(), FILE_A_CONTENT);
}

#[test]
fn unknown_payload_identifier_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let built = build_image(tmp.path());

    let workdir = tmp.path().join("deploy-work");
    fs::create_dir_all(&workdir).unwrap();
    let source = ImageSource::detect(&built.image_root).unwrap();
    let missing = ImageIdentifier::new("main", ReleaseKey::Prd);
    assert!(DeploySetup::new(source, &missing, &workdir).is_err());
}

#[test]
fn blob_verification_covers_the_whole_store() {
    let tmp = tempfile::tempdir().unwrap();
    let built = build_image(tmp.path());
    let source = ImageSource::detect(&built.image_root).unwrap();
    let count = otaimg::verify::verify_image_blobs(&source, None, 4).unwrap();
    assert!(count >= 4);

    // corrupt one blob; verification must fail closed
    let image = ImageDir::open(&built.image_root).unwrap();
    let victim = fs::read_dir(image.resource_dir())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    fs::write(&victim, b"corrupted").unwrap();
    assert!(otaimg::verify::verify_image_blobs(&source, None, 4).is_err());
}
