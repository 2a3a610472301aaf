use zipweld::parse::{EntrySpec, Method};
use zipweld_sync::{
    ArchiveWriter, MultiSegmentChannel, ReadZip, SplitSink, WriteOptions,
};

fn write_split_archive(dir: &std::path::Path, split_size: u64) -> Vec<std::path::PathBuf> {
    let target = dir.join("backup.zip");
    let sink = SplitSink::create(&target, split_size).unwrap();
    let mut writer = ArchiveWriter::from_sink(sink, WriteOptions::default());

    for i in 0..4 {
        let mut spec = EntrySpec::new(format!("blob-{i}.bin"));
        spec.set_method(Method::Store);
        let content = vec![i as u8; 100 * 1024];
        spec.set_size(content.len() as u64);
        spec.set_crc32(crc32fast::hash(&content));
        writer.put_entry(&spec).unwrap();
        writer.write(&content).unwrap();
        writer.close_entry().unwrap();
    }
    writer.close().unwrap();

    // segments in disk order: .z01, .z02, ..., then the final .zip
    let mut segments: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.starts_with('z') && e != "zip")
        })
        .collect();
    segments.sort();
    segments.push(target);
    segments
}

#[test_log::test]
fn split_archives_roll_over_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let segments = write_split_archive(dir.path(), 128 * 1024);
    assert!(segments.len() > 2, "expected rollover, got {segments:?}");

    let channel = MultiSegmentChannel::open_paths(&segments).unwrap();
    let archive = channel.read_zip().unwrap();
    assert_eq!(archive.entries().count(), 4);
    for i in 0..4u8 {
        let entry = archive.by_name(format!("blob-{i}.bin")).unwrap();
        let content = entry.bytes().unwrap();
        assert_eq!(content.len(), 100 * 1024);
        assert!(content.iter().all(|&b| b == i));
    }
}

#[test_log::test]
fn split_join_equals_stripped_concatenation() {
    let dir = tempfile::tempdir().unwrap();
    let segments = write_split_archive(dir.path(), 128 * 1024);

    // concatenate all segments and strip the 4-byte split marker
    let mut concatenated = Vec::new();
    for segment in &segments {
        concatenated.extend_from_slice(&std::fs::read(segment).unwrap());
    }
    let stripped = concatenated[4..].to_vec();

    let from_concat = stripped.read_zip().unwrap();
    let channel = MultiSegmentChannel::open_paths(&segments).unwrap();
    let from_channel = channel.read_zip().unwrap();

    let names_concat: Vec<_> = from_concat.entries().map(|e| e.name.clone()).collect();
    let names_channel: Vec<_> = from_channel.entries().map(|e| e.name.clone()).collect();
    assert_eq!(names_concat, names_channel);

    for name in names_concat {
        let a = from_concat.by_name(&name).unwrap();
        let b = from_channel.by_name(&name).unwrap();
        assert_eq!(a.crc32, b.crc32);
        assert_eq!(a.bytes().unwrap(), b.bytes().unwrap());
    }
}

#[test]
fn entries_report_their_starting_disk() {
    let dir = tempfile::tempdir().unwrap();
    let segments = write_split_archive(dir.path(), 128 * 1024);

    let channel = MultiSegmentChannel::open_paths(&segments).unwrap();
    let archive = channel.read_zip().unwrap();
    let last = archive.by_name("blob-3.bin").unwrap();
    assert!(last.disk_nbr_start > 0, "last entry should start past disk 0");

    // physical order equals insertion order for a straight-line write
    let physical: Vec<_> = archive
        .entries_in_physical_order()
        .into_iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(
        physical,
        vec!["blob-0.bin", "blob-1.bin", "blob-2.bin", "blob-3.bin"]
    );
}

#[test]
fn tiny_split_sizes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SplitSink::create(dir.path().join("x.zip"), 1024).is_err());
    assert!(SplitSink::create(dir.path().join("y.zip"), 64 * 1024).is_ok());
}
