//! Archive compaction: reclaiming space and relocating file data

use squall::{Archive, CreateOptions, Error, FileOptions};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 211 + 13) as u8).collect()
}

fn bare_options() -> CreateOptions {
    CreateOptions::new().listfile(false).attributes(false)
}

#[test]
fn compaction_reclaims_removed_space() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.mpq");

    let mut archive = Archive::create(&path, bare_options()).unwrap();
    archive.add_file("a.bin", &sample(50_000), &FileOptions::new()).unwrap();
    archive.add_file("b.bin", &sample(80_000), &FileOptions::new()).unwrap();
    archive.add_file("c.bin", &sample(10_000), &FileOptions::new()).unwrap();
    archive.remove_file("b.bin").unwrap();
    archive.flush().unwrap();

    let before = std::fs::metadata(&path).unwrap().len();
    archive.compact().unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "no space reclaimed ({before} -> {after})");

    // A compacted archive is gap-free: header, then file data, then
    // the two tables, nothing in between.
    let mut compressed_total = 0;
    let mut count = 0u64;
    let handle = archive.find_first("*").unwrap();
    while let Some(found) = archive.find_next(handle).unwrap() {
        compressed_total += found.compressed_size;
        count += 1;
    }
    assert_eq!(count, 2);
    let tables = 16 * u64::from(archive.max_file_count()) + 16 * count;
    assert_eq!(after, 0x20 + compressed_total + tables);

    assert_eq!(archive.read_file("a.bin").unwrap(), sample(50_000));
    assert_eq!(archive.read_file("c.bin").unwrap(), sample(10_000));
    assert!(!archive.has_file("b.bin"));

    archive.close().unwrap();
    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.read_file("a.bin").unwrap(), sample(50_000));
    assert_eq!(archive.read_file("c.bin").unwrap(), sample(10_000));
}

#[test]
fn cancelled_compaction_leaves_the_original_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancelled.mpq");

    let mut archive = Archive::create(&path, bare_options()).unwrap();
    archive.add_file("x.bin", &sample(200_000), &FileOptions::new()).unwrap();
    archive.add_file("y.bin", &sample(150_000), &FileOptions::new()).unwrap();
    archive.remove_file("x.bin").unwrap();
    archive.flush().unwrap();
    let baseline = std::fs::read(&path).unwrap();

    // Cancel after the first chunk has landed in the temp file.
    let finished = archive
        .compact_with_progress(|done, _| done == 0)
        .unwrap();
    assert!(!finished);

    assert_eq!(std::fs::read(&path).unwrap(), baseline);
    assert_eq!(archive.read_file("y.bin").unwrap(), sample(150_000));

    // No temp file left behind either.
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .count();
    assert_eq!(leftovers, 1);
}

#[test]
fn keyed_files_survive_relocation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rekey.mpq");

    let data = sample(30_000);
    let mut archive = Archive::create(&path, bare_options()).unwrap();
    archive.add_file("gap.bin", &sample(100_000), &FileOptions::new()).unwrap();
    archive
        .add_file(
            "keyed.bin",
            &data,
            &FileOptions::new().encrypt(true).fix_key(true),
        )
        .unwrap();
    archive
        .add_file("sealed.bin", &data, &FileOptions::new().encrypt(true))
        .unwrap();
    archive.remove_file("gap.bin").unwrap();

    archive.compact().unwrap();
    assert_eq!(archive.read_file("keyed.bin").unwrap(), data);
    assert_eq!(archive.read_file("sealed.bin").unwrap(), data);

    archive.close().unwrap();
    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.read_file("keyed.bin").unwrap(), data);
    assert_eq!(archive.read_file("sealed.bin").unwrap(), data);
}

#[test]
fn attributes_follow_the_compacted_block_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attrs.mpq");

    let kept = sample(7000);
    let mut archive = Archive::create(&path, CreateOptions::new()).unwrap();
    archive.add_file("dropped.bin", &sample(40_000), &FileOptions::new()).unwrap();
    archive.add_file("kept.bin", &kept, &FileOptions::new()).unwrap();
    archive.remove_file("dropped.bin").unwrap();
    archive.compact().unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.read_file("kept.bin").unwrap(), kept);

    let mut entries = 0;
    let handle = archive.find_first("*").unwrap();
    while archive.find_next(handle).unwrap().is_some() {
        entries += 1;
    }
    let raw = archive.read_file("(attributes)").unwrap();
    let parsed = squall::special_files::Attributes::parse(&raw, entries).unwrap();
    assert!(parsed.crc32.contains(&crc32fast::hash(&kept)));
}

#[test]
fn compaction_invalidates_open_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.mpq");

    let mut archive = Archive::create(&path, bare_options()).unwrap();
    archive.add_file("a.bin", &sample(5000), &FileOptions::new()).unwrap();
    archive.add_file("b.bin", &sample(5000), &FileOptions::new()).unwrap();
    archive.remove_file("a.bin").unwrap();

    let read = archive.open_file("b.bin").unwrap();
    let finder = archive.find_first("*").unwrap();
    archive.compact().unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(
        archive.file_read(read, &mut buf),
        Err(Error::InvalidHandle)
    ));
    assert!(matches!(
        archive.find_next(finder),
        Err(Error::InvalidHandle)
    ));
}

#[test]
fn compacting_a_tidy_archive_is_a_fixed_point() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidy.mpq");

    let mut archive = Archive::create(&path, bare_options()).unwrap();
    archive.add_file("one.bin", &sample(20_000), &FileOptions::new()).unwrap();
    archive.add_file("two.bin", &sample(20_000), &FileOptions::new()).unwrap();

    archive.compact().unwrap();
    let first = std::fs::read(&path).unwrap();
    archive.compact().unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first.len(), second.len());
    assert_eq!(archive.read_file("one.bin").unwrap(), sample(20_000));
    assert_eq!(archive.read_file("two.bin").unwrap(), sample(20_000));
}
