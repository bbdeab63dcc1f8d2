//! Create archives, reopen them from disk, and read everything back

use pretty_assertions::assert_eq;
use squall::{Archive, CompressionMethod, CreateOptions, FileOptions, FormatVersion};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn mixed_storage_options_round_trip() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.mpq");

    let files: Vec<(&str, Vec<u8>, FileOptions)> = vec![
        ("plain.bin", sample(1000), FileOptions::new().compression(CompressionMethod::None)),
        ("compressed.bin", sample(9000), FileOptions::new()),
        (
            "secret.bin",
            sample(5000),
            FileOptions::new().encrypt(true),
        ),
        (
            "keyed.bin",
            sample(3000),
            FileOptions::new().encrypt(true).fix_key(true),
        ),
        ("unit.bin", sample(2000), FileOptions::new().single_unit(true)),
        ("checked.bin", sample(7000), FileOptions::new().sector_crc(true)),
        ("empty.bin", Vec::new(), FileOptions::new()),
    ];

    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    for (name, data, options) in &files {
        archive.add_file(name, data, options).unwrap();
    }
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    for (name, data, _) in &files {
        assert!(archive.has_file(name), "{name} missing after reopen");
        assert_eq!(&archive.read_file(name).unwrap(), data, "{name} data differs");
    }

    let listed = archive.list().unwrap();
    assert_eq!(listed.len(), files.len());
    for (name, _, _) in &files {
        assert!(listed.iter().any(|listed| listed == name));
    }
}

#[test]
fn every_format_version_round_trips() {
    for version in [
        FormatVersion::V1,
        FormatVersion::V2,
        FormatVersion::V3,
        FormatVersion::V4,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versioned.mpq");

        let mut archive =
            Archive::create(&path, CreateOptions::new().version(version)).unwrap();
        archive
            .add_file("data\\payload.bin", &sample(20_000), &FileOptions::new())
            .unwrap();
        archive.close().unwrap();

        let mut archive = Archive::open(&path).unwrap();
        assert_eq!(archive.format_version(), version);
        assert_eq!(archive.read_file("data\\payload.bin").unwrap(), sample(20_000));
    }
}

#[test]
fn lookups_fold_case_and_separators() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case.mpq");

    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    archive
        .add_file("Units\\Human\\Footman.mdx", &sample(64), &FileOptions::new())
        .unwrap();

    assert!(archive.has_file("units\\human\\footman.mdx"));
    assert!(archive.has_file("UNITS/HUMAN/FOOTMAN.MDX"));
    assert_eq!(
        archive.read_file("units/human/footman.mdx").unwrap(),
        sample(64)
    );
}

#[test]
fn internal_files_are_readable_but_not_writable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("internal.mpq");

    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    archive
        .add_file("war3map.j", &sample(100), &FileOptions::new())
        .unwrap();
    archive.flush().unwrap();

    let listfile = archive.read_file("(listfile)").unwrap();
    let text = String::from_utf8(listfile).unwrap();
    assert!(text.contains("war3map.j"));
    assert!(text.contains("(listfile)"));

    let err = archive
        .add_file("(listfile)", b"forged", &FileOptions::new())
        .unwrap_err();
    assert!(matches!(err, squall::Error::AccessDenied));
    let err = archive.remove_file("(attributes)").unwrap_err();
    assert!(matches!(err, squall::Error::AccessDenied));
}

#[test]
fn attributes_track_added_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attrs.mpq");

    let data = sample(1234);
    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    archive.add_file("tracked.bin", &data, &FileOptions::new()).unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    let raw = archive.read_file("(attributes)").unwrap();

    let mut entries = 0;
    let finder = archive.find_first("*").unwrap();
    while archive.find_next(finder).unwrap().is_some() {
        entries += 1;
    }
    let parsed = squall::special_files::Attributes::parse(&raw, entries).unwrap();
    assert_eq!(parsed.crc32.len(), entries);
    assert!(parsed.crc32.contains(&crc32fast::hash(&data)));
}

#[test]
fn checksummed_files_verify_on_read() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crc.mpq");

    let data = sample(1000);
    let mut archive = Archive::create(
        &path,
        CreateOptions::new().listfile(false).attributes(false),
    )
    .unwrap();
    archive
        .add_file("checked.bin", &data, &FileOptions::new().sector_crc(true))
        .unwrap();

    let finder = archive.find_first("checked.bin").unwrap();
    let compressed_size = archive.find_next(finder).unwrap().unwrap().compressed_size;
    archive.close_finder(finder).unwrap();
    archive.close().unwrap();

    // Flip a byte inside the trailing checksum table. The file data
    // region starts right after the header in an archive with no
    // internal files.
    let mut raw = std::fs::read(&path).unwrap();
    let target = 0x20 + compressed_size as usize - 2;
    raw[target] ^= 0xFF;
    std::fs::write(&path, &raw).unwrap();

    let mut lenient = Archive::open(&path).unwrap();
    assert_eq!(lenient.read_file("checked.bin").unwrap(), data);

    let mut strict = Archive::open_with(
        &path,
        squall::OpenOptions::new().verify_checksums(true),
    )
    .unwrap();
    let err = strict.read_file("checked.bin").unwrap_err();
    assert!(matches!(err, squall::Error::Corrupt(_)));
}

#[test]
fn extract_all_writes_the_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.mpq");
    let out = dir.path().join("out");

    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    archive
        .add_file("units\\human\\footman.txt", b"melee", &FileOptions::new())
        .unwrap();
    archive
        .add_file("scripts\\common.j", b"globals", &FileOptions::new())
        .unwrap();
    archive.extract_all(&out).unwrap();

    assert_eq!(
        std::fs::read(out.join("units").join("human").join("footman.txt")).unwrap(),
        b"melee"
    );
    assert_eq!(
        std::fs::read(out.join("scripts").join("common.j")).unwrap(),
        b"globals"
    );
}

#[test]
fn open_rejects_non_archives() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-an-archive.bin");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();

    let err = Archive::open(&path).unwrap_err();
    assert!(matches!(err, squall::Error::BadFormat(_)));
}
