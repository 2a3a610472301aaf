use std::io::Cursor;

use chrono::{TimeZone, Utc};
use winnow::{Parser, Partial};
use zipweld::{
    encoding::Encoding,
    error::Error,
    options::ReadOptions,
    parse::{EntrySpec, ExtraField, LocalFileHeader, Method, NameSource},
};
use zipweld_sync::{
    ArchiveWriter, ReadZip, StreamSink, UnicodeExtraPolicy, WriteOptions, Zip64Mode,
};

fn seekable_writer() -> ArchiveWriter<zipweld_sync::SeekSink<Cursor<Vec<u8>>>> {
    ArchiveWriter::new(Cursor::new(Vec::new()))
}

fn finish_seekable(writer: ArchiveWriter<zipweld_sync::SeekSink<Cursor<Vec<u8>>>>) -> Vec<u8> {
    writer.close().unwrap().into_inner().into_inner()
}

#[test_log::test]
fn stored_entry_round_trips() {
    // one STORED entry named "a.txt" with content "abc"
    let mut writer = seekable_writer();
    let mut spec = EntrySpec::new("a.txt");
    spec.set_method(Method::Store);
    writer.put_entry(&spec).unwrap();
    writer.write(b"abc").unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    let archive = bytes.read_zip().unwrap();
    assert_eq!(archive.entries().count(), 1);

    let entry = archive.by_name("a.txt").unwrap();
    assert_eq!(entry.uncompressed_size, 3);
    assert_eq!(entry.compressed_size, 3);
    assert_eq!(entry.crc32, 0x352441C2);
    assert_eq!(entry.method, Method::Store);
    assert_eq!(entry.bytes().unwrap(), b"abc");
}

#[test_log::test]
fn deflated_run_compresses_well() {
    let content = vec![0x55u8; 1_000_000];
    let mut writer = seekable_writer();
    writer.put_entry(&EntrySpec::new("data.bin")).unwrap();
    writer.write(&content).unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("data.bin").unwrap();
    assert_eq!(entry.uncompressed_size, 1_000_000);
    assert!(
        entry.compressed_size < 5_000,
        "compressed to {} bytes",
        entry.compressed_size
    );
    let read_back = entry.bytes().unwrap();
    assert_eq!(read_back.len(), 1_000_000);
    assert!(read_back.iter().all(|&b| b == 0x55));
}

#[test]
fn metadata_survives_write_then_read() {
    let modified = Utc.with_ymd_and_hms(2019, 6, 12, 8, 44, 30).unwrap();

    let mut writer = seekable_writer();
    let mut spec = EntrySpec::new("src/lib.rs");
    spec.set_modified(modified);
    spec.set_comment("the important one");
    spec.set_unix_mode(0o644);
    writer.put_entry(&spec).unwrap();
    writer.write(b"pub fn answer() -> u32 { 42 }\n").unwrap();
    writer.close_entry().unwrap();

    let mut dir = EntrySpec::new("src/");
    dir.set_unix_mode(0o755);
    writer.put_entry(&dir).unwrap();
    writer.close_entry().unwrap();

    let bytes = finish_seekable(writer);
    let archive = bytes.read_zip().unwrap();

    let entry = archive.by_name("src/lib.rs").unwrap();
    assert_eq!(entry.modified, modified);
    assert_eq!(entry.comment.as_deref(), Some("the important one"));
    assert_eq!(entry.external_attrs >> 16, 0o100644);
    assert_eq!(entry.mode.0 & 0o777, 0o644);

    let dir = archive.by_name("src/").unwrap();
    assert!(dir.is_directory());
    assert_eq!(dir.method, Method::Store);
}

#[test]
fn central_directory_agrees_with_local_headers() {
    let mut writer = seekable_writer();
    for (name, content) in [("one", &b"first contents"[..]), ("two", b"second contents")] {
        writer.put_entry(&EntrySpec::new(name)).unwrap();
        writer.write(content).unwrap();
        writer.close_entry().unwrap();
    }
    let bytes = finish_seekable(writer);
    let archive = bytes.read_zip().unwrap();

    for entry in archive.entries() {
        let mut input = Partial::new(&bytes[entry.header_offset as usize..]);
        let local = LocalFileHeader::parser.parse_next(&mut input).unwrap();
        assert_eq!(local.crc32, entry.crc32, "{}", entry.name);
        assert_eq!(local.compressed_size as u64, entry.compressed_size);
        assert_eq!(local.uncompressed_size as u64, entry.uncompressed_size);
    }
}

#[test]
fn streaming_sink_descriptors_agree_with_central_directory() {
    let mut writer = ArchiveWriter::new_streaming(Vec::new());
    writer.put_entry(&EntrySpec::new("streamed.txt")).unwrap();
    writer.write(b"written without seeking back").unwrap();
    writer.close_entry().unwrap();
    let bytes = writer.close().unwrap().into_inner();

    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("streamed.txt").unwrap();
    assert!(entry.has_data_descriptor());
    assert_eq!(entry.bytes().unwrap(), b"written without seeking back");
}

#[test]
fn unicode_path_extra_overrides_name() {
    let options = WriteOptions {
        encoding: Encoding::Cp437,
        fallback_to_utf8: false,
        unicode_extras: UnicodeExtraPolicy::Always,
        ..WriteOptions::default()
    };
    let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);
    writer.put_entry(&EntrySpec::new("日本語.txt")).unwrap();
    writer.write(b"konnichiwa").unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    // with unicode extras honored, the name comes from the extra field
    let archive = bytes.read_zip().unwrap();
    let entry = archive.entries().next().unwrap();
    assert_eq!(entry.name, "日本語.txt");
    assert_eq!(entry.name_source, NameSource::UnicodeExtraField);
    assert_eq!(entry.bytes().unwrap(), b"konnichiwa");

    // with them ignored, we see the raw encoded form (%U escapes)
    let options = ReadOptions {
        use_unicode_extra_fields: false,
        ..ReadOptions::default()
    };
    let archive = bytes.read_zip_with_options(options).unwrap();
    let entry = archive.entries().next().unwrap();
    assert_eq!(entry.name, "%U65E5%U672C%U8A9E.txt");
    assert_eq!(entry.name_source, NameSource::Name);
}

#[test]
fn alignment_pads_the_data_offset() {
    let mut writer = seekable_writer();

    let mut first = EntrySpec::new("padding-fodder");
    first.set_method(Method::Store);
    writer.put_entry(&first).unwrap();
    writer.write(b"x").unwrap();
    writer.close_entry().unwrap();

    let mut aligned = EntrySpec::new("aligned.bin");
    aligned.set_method(Method::Store);
    aligned.set_alignment(64).unwrap();
    writer.put_entry(&aligned).unwrap();
    writer.write(b"aligned contents").unwrap();
    writer.close_entry().unwrap();

    let bytes = finish_seekable(writer);
    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("aligned.bin").unwrap();
    let data_offset = entry.data_offset().unwrap();
    assert_eq!(data_offset % 64, 0, "data offset {data_offset}");
    assert_eq!(entry.bytes().unwrap(), b"aligned contents");

    // the alignment request round-trips through the extra field
    assert!(entry
        .extra_fields
        .iter()
        .any(|f| matches!(f, ExtraField::ResourceAlignment(a) if a.alignment == 64)));
}

#[test]
fn zip64_never_rejects_huge_declared_entries() {
    let options = WriteOptions {
        zip64: Zip64Mode::Never,
        ..WriteOptions::default()
    };
    let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);

    let mut spec = EntrySpec::new("huge.bin");
    spec.set_size(5 * 1024 * 1024 * 1024);
    let err = writer.put_entry(&spec).unwrap_err();
    assert!(
        matches!(err, Error::Zip64Required(zipweld::error::Zip64Error::EntryTooBig)),
        "got {err:?}"
    );
}

#[test]
fn zip64_as_needed_matches_never_for_small_archives() {
    // nothing in these archives overflows a 32-bit counter, so the two
    // modes must produce identical bytes on every kind of sink
    fn specs() -> impl Iterator<Item = (EntrySpec, Vec<u8>)> {
        (0..4).map(|i| {
            let mut spec = EntrySpec::new(format!("file-{i}.txt"));
            spec.set_modified(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
            (spec, format!("contents of file {i}").into_bytes())
        })
    }

    let write_streaming = |mode: Zip64Mode| {
        let options = WriteOptions {
            zip64: mode,
            ..WriteOptions::default()
        };
        let mut writer = ArchiveWriter::new_streaming_with_options(Vec::new(), options);
        for (spec, content) in specs() {
            writer.put_entry(&spec).unwrap();
            writer.write(&content).unwrap();
            writer.close_entry().unwrap();
        }
        writer.close().unwrap().into_inner()
    };

    let write_seekable = |mode: Zip64Mode| {
        let options = WriteOptions {
            zip64: mode,
            ..WriteOptions::default()
        };
        let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);
        for (spec, content) in specs() {
            writer.put_entry(&spec).unwrap();
            writer.write(&content).unwrap();
            writer.close_entry().unwrap();
        }
        finish_seekable(writer)
    };

    assert_eq!(
        write_streaming(Zip64Mode::AsNeeded),
        write_streaming(Zip64Mode::Never)
    );
    assert_eq!(
        write_seekable(Zip64Mode::AsNeeded),
        write_seekable(Zip64Mode::Never)
    );
}

#[test]
fn zip64_always_archives_read_back() {
    let options = WriteOptions {
        zip64: Zip64Mode::Always,
        ..WriteOptions::default()
    };
    let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);
    writer.put_entry(&EntrySpec::new("small")).unwrap();
    writer.write(b"zip64 everywhere").unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("small").unwrap();
    assert!(entry.is_zip64);
    assert_eq!(entry.bytes().unwrap(), b"zip64 everywhere");
}

#[test]
fn raw_copy_preserves_compressed_bytes() {
    // source archive with a deflated entry
    let mut writer = seekable_writer();
    writer.put_entry(&EntrySpec::new("carried.txt")).unwrap();
    writer
        .write(b"this will be copied without recompression")
        .unwrap();
    writer.close_entry().unwrap();
    let source = finish_seekable(writer);

    let source_archive = source.read_zip().unwrap();
    let entry = source_archive.by_name("carried.txt").unwrap();
    let raw = entry.raw_entry();
    let raw_reader = entry.raw_reader().unwrap();

    // destination: ingest verbatim
    let mut writer = seekable_writer();
    writer.add_raw_entry(&raw, raw_reader).unwrap();
    let dest = finish_seekable(writer);

    let dest_archive = dest.read_zip().unwrap();
    let copied = dest_archive.by_name("carried.txt").unwrap();
    assert_eq!(copied.crc32, entry.crc32);
    assert_eq!(copied.compressed_size, entry.compressed_size);
    assert_eq!(
        copied.bytes().unwrap(),
        b"this will be copied without recompression"
    );
}

#[test]
fn duplicate_names_are_kept_in_order() {
    let mut writer = seekable_writer();
    for content in [&b"first"[..], b"second"] {
        let mut spec = EntrySpec::new("same-name");
        spec.set_method(Method::Store);
        writer.put_entry(&spec).unwrap();
        writer.write(content).unwrap();
        writer.close_entry().unwrap();
    }
    let bytes = finish_seekable(writer);
    let archive = bytes.read_zip().unwrap();

    let found: Vec<_> = archive.entries_by_name("same-name").collect();
    assert_eq!(found.len(), 2);
    // by_name picks the first one in central directory order
    let first = archive.by_name("same-name").unwrap();
    assert_eq!(first.bytes().unwrap(), b"first");
}

#[test]
fn writer_enforces_entry_lifecycle() {
    let mut writer = seekable_writer();
    assert!(writer.write(b"no entry open").is_err());
    assert!(writer.close_entry().is_err());

    writer.put_entry(&EntrySpec::new("a")).unwrap();
    let err = writer.put_entry(&EntrySpec::new("b")).unwrap_err();
    assert!(matches!(err, Error::BadArgument(_)));
    writer.close_entry().unwrap();

    writer.finish().unwrap();
    assert!(writer.put_entry(&EntrySpec::new("late")).is_err());
}

#[test]
fn stored_streaming_requires_upfront_sizes() {
    let mut writer = ArchiveWriter::new_streaming(Vec::new());
    let mut spec = EntrySpec::new("stored.bin");
    spec.set_method(Method::Store);
    assert!(matches!(
        writer.put_entry(&spec),
        Err(Error::BadArgument(_))
    ));

    spec.set_size(3);
    spec.set_crc32(crc32fast::hash(b"abc"));
    writer.put_entry(&spec).unwrap();
    writer.write(b"abc").unwrap();
    writer.close_entry().unwrap();
    let bytes = writer.close().unwrap().into_inner();

    let archive = bytes.read_zip().unwrap();
    let entry = archive.by_name("stored.bin").unwrap();
    assert!(!entry.has_data_descriptor());
    assert_eq!(entry.bytes().unwrap(), b"abc");
}

#[test]
fn archive_comment_round_trips() {
    let options = WriteOptions {
        comment: Some("weekly backup".to_string()),
        ..WriteOptions::default()
    };
    let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);
    writer.put_entry(&EntrySpec::new("x")).unwrap();
    writer.write(b"y").unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    let archive = bytes.read_zip().unwrap();
    assert_eq!(archive.comment(), Some("weekly backup"));
}

#[test]
fn shift_jis_names_decode_with_forced_encoding() {
    let options = WriteOptions {
        encoding: Encoding::ShiftJis,
        use_utf8_flag: false,
        ..WriteOptions::default()
    };
    let mut writer = ArchiveWriter::with_options(Cursor::new(Vec::new()), options);
    writer.put_entry(&EntrySpec::new("表計算.txt")).unwrap();
    writer.write(b"spreadsheet").unwrap();
    writer.close_entry().unwrap();
    let bytes = finish_seekable(writer);

    let options = ReadOptions {
        encoding: zipweld::options::EncodingPolicy::Forced(Encoding::ShiftJis),
        ..ReadOptions::default()
    };
    let archive = bytes.read_zip_with_options(options).unwrap();
    assert!(archive.by_name("表計算.txt").is_some());
}

#[test]
fn custom_sinks_plug_into_from_sink() {
    let mut writer = ArchiveWriter::from_sink(
        StreamSink::new(Vec::new()),
        WriteOptions::default(),
    );
    writer.put_entry(&EntrySpec::new("ok")).unwrap();
    writer.write(b"fine").unwrap();
    writer.close_entry().unwrap();
    let bytes = writer.close().unwrap().into_inner();
    assert!(bytes.read_zip().is_ok());
}
