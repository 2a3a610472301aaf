use std::io::Cursor;

use zipweld::parse::{EntrySpec, Method};
use zipweld_sync::{ArchiveWriter, ParallelZipCreator, ReadZip};

#[test_log::test]
fn scattered_entries_gather_into_one_archive() {
    let mut creator = ParallelZipCreator::with_config(
        3,
        std::env::temp_dir(),
        6,
    );

    for i in 0..20 {
        let spec = EntrySpec::new(format!("part-{i:02}.txt"));
        let content: Vec<u8> = format!("contents of part {i}, repeated {}", "x".repeat(i * 100))
            .into_bytes();
        creator
            .add(
                spec,
                Box::new(move || Ok(Box::new(Cursor::new(content)) as Box<dyn std::io::Read + Send>)),
            )
            .unwrap();
    }

    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    creator.write_to(&mut writer).unwrap();
    let bytes = writer.close().unwrap().into_inner().into_inner();

    let archive = bytes.read_zip().unwrap();
    assert_eq!(archive.entries().count(), 20);
    for i in 0..20 {
        let entry = archive.by_name(format!("part-{i:02}.txt")).unwrap();
        let expected =
            format!("contents of part {i}, repeated {}", "x".repeat(i * 100)).into_bytes();
        assert_eq!(entry.bytes().unwrap(), expected, "part {i}");
    }
}

#[test]
fn stored_entries_can_scatter_too() {
    let mut creator = ParallelZipCreator::new();
    let mut spec = EntrySpec::new("stored.bin");
    spec.set_method(Method::Store);
    creator
        .add(
            spec,
            Box::new(|| Ok(Box::new(Cursor::new(vec![0xABu8; 4096])) as Box<dyn std::io::Read + Send>)),
        )
        .unwrap();

    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    creator.write_to(&mut writer).unwrap();
    let bytes = writer.close().unwrap().into_inner().into_inner();

    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("stored.bin").unwrap();
    assert_eq!(entry.method, Method::Store);
    assert_eq!(entry.compressed_size, 4096);
    assert_eq!(entry.bytes().unwrap(), vec![0xABu8; 4096]);
}

#[test]
fn supplier_failures_surface_at_join_time() {
    let mut creator = ParallelZipCreator::with_config(2, std::env::temp_dir(), 6);

    creator
        .add(
            EntrySpec::new("fine.txt"),
            Box::new(|| Ok(Box::new(Cursor::new(b"ok".to_vec())) as Box<dyn std::io::Read + Send>)),
        )
        .unwrap();
    creator
        .add(
            EntrySpec::new("doomed.txt"),
            Box::new(|| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source disappeared",
                ))
            }),
        )
        .unwrap();

    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    let err = creator.write_to(&mut writer).unwrap_err();
    assert!(err.to_string().contains("source disappeared"), "got {err}");
}

#[test]
fn workers_keep_per_worker_order() {
    // a single worker preserves submission order exactly
    let mut creator = ParallelZipCreator::with_config(1, std::env::temp_dir(), 1);
    for i in 0..5 {
        creator
            .add(
                EntrySpec::new(format!("seq-{i}")),
                Box::new(move || {
                    Ok(Box::new(Cursor::new(format!("{i}").into_bytes())) as Box<dyn std::io::Read + Send>)
                }),
            )
            .unwrap();
    }

    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    creator.write_to(&mut writer).unwrap();
    let bytes = writer.close().unwrap().into_inner().into_inner();

    let archive = bytes.read_zip().unwrap();
    let names: Vec<_> = archive
        .entries_in_physical_order()
        .into_iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["seq-0", "seq-1", "seq-2", "seq-3", "seq-4"]);
}
