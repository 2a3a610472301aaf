use std::io::Read;

use zipweld::{
    error::{Error, UnsupportedError},
    options::ReadOptions,
    parse::{EntrySpec, Method},
};
use zipweld_sync::{ArchiveWriter, ReadZipStreaming};

fn archive_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ArchiveWriter::new_streaming(Vec::new());
    for (name, content) in entries {
        writer.put_entry(&EntrySpec::new(*name)).unwrap();
        writer.write(content).unwrap();
        writer.close_entry().unwrap();
    }
    writer.close().unwrap().into_inner()
}

#[test_log::test]
fn entries_stream_in_order() {
    let bytes = archive_with(&[
        ("first.txt", b"uno"),
        ("second.txt", b"dos"),
        ("third.txt", b"tres"),
    ]);

    let mut reader = bytes
        .as_slice()
        .stream_zip_entries()
        .unwrap()
        .expect("not empty");

    let mut names = Vec::new();
    let mut contents = Vec::new();
    loop {
        names.push(reader.entry().name.clone());
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        contents.push(content);
        match reader.finish().unwrap() {
            Some(next) => reader = next,
            None => break,
        }
    }

    assert_eq!(names, vec!["first.txt", "second.txt", "third.txt"]);
    assert_eq!(contents[0], b"uno");
    assert_eq!(contents[1], b"dos");
    assert_eq!(contents[2], b"tres");
}

#[test]
fn unread_entries_are_skipped_on_finish() {
    let bytes = archive_with(&[("skipped.bin", &[7u8; 100_000]), ("wanted.txt", b"here")]);

    let reader = bytes
        .as_slice()
        .stream_zip_entries()
        .unwrap()
        .expect("not empty");
    // never read from the first entry at all
    let mut reader = reader.finish().unwrap().expect("second entry");
    assert_eq!(reader.entry().name, "wanted.txt");
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"here");
    assert!(reader.finish().unwrap().is_none());
}

#[test]
fn empty_archives_stream_no_entries() {
    let bytes = archive_with(&[]);
    assert!(bytes.as_slice().stream_zip_entries().unwrap().is_none());
}

// Build an archive holding one STORED entry whose sizes live only in the
// trailing data descriptor: the shape `zip -` produces on a pipe.
fn stored_with_descriptor(name: &str, content: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();

    // local file header with bit 3 set and zeroed sizes
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&20u16.to_le_bytes()); // version needed
    bytes.extend_from_slice(&0b1000u16.to_le_bytes()); // flags: descriptor
    bytes.extend_from_slice(&0u16.to_le_bytes()); // method: store
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes()); // dos time/date
    bytes.extend_from_slice(&[0; 12]); // crc + sizes unknown
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());

    let header_offset = 0u32;
    bytes.extend_from_slice(content);

    // data descriptor, with signature and 4-byte sizes
    let crc = crc32fast::hash(content);
    bytes.extend_from_slice(b"PK\x07\x08");
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());

    // central directory
    let cd_offset = bytes.len() as u32;
    bytes.extend_from_slice(b"PK\x01\x02");
    bytes.extend_from_slice(&20u16.to_le_bytes()); // version made by
    bytes.extend_from_slice(&20u16.to_le_bytes()); // version needed
    bytes.extend_from_slice(&0b1000u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&[0; 2 + 2 + 2 + 2]); // extra, comment, disk, internal
    bytes.extend_from_slice(&0u32.to_le_bytes()); // external attrs
    bytes.extend_from_slice(&header_offset.to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
    let cd_size = bytes.len() as u32 - cd_offset;

    // end of central directory
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0; 4]); // disk numbers
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&cd_size.to_le_bytes());
    bytes.extend_from_slice(&cd_offset.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes()); // comment length

    bytes
}

#[test_log::test]
fn stored_descriptor_entries_need_opt_in() {
    let bytes = stored_with_descriptor("piped.txt", b"came through a pipe");

    let err = bytes.as_slice().stream_zip_entries().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Unsupported(UnsupportedError::DataDescriptor)
        ),
        "got {err:?}"
    );
}

#[test_log::test]
fn stored_descriptor_lookahead_finds_the_body() {
    let content = b"came through a pipe, size unknown until the very end";
    let bytes = stored_with_descriptor("piped.txt", content);

    let options = ReadOptions {
        allow_stored_with_data_descriptor: true,
        ..ReadOptions::default()
    };
    let mut reader = bytes
        .as_slice()
        .stream_zip_entries_with_options(options)
        .unwrap()
        .expect("one entry");

    // before any read, the sizes are unknown
    let entry = reader.entry();
    assert_eq!(entry.name, "piped.txt");
    assert_eq!(entry.uncompressed_size, 0);
    assert!(entry.has_data_descriptor());
    assert_eq!(entry.method, Method::Store);

    // the first read triggers the lookahead scan; the crc check happens
    // against the descriptor on close
    let mut read_back = Vec::new();
    reader.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, content);
    assert!(reader.finish().unwrap().is_none());
}

#[test]
fn corrupted_stored_descriptor_fails_the_crc_check() {
    let content = b"something that will get flipped";
    let mut bytes = stored_with_descriptor("x", content);
    // flip a byte inside the body
    let flip_at = 30 + 1 + 4;
    bytes[flip_at] ^= 0xFF;

    let options = ReadOptions {
        allow_stored_with_data_descriptor: true,
        ..ReadOptions::default()
    };
    let mut reader = bytes
        .as_slice()
        .stream_zip_entries_with_options(options)
        .unwrap()
        .expect("one entry");
    let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
    assert!(err.to_string().contains("checksum"), "got {err}");
}

#[test]
fn split_marker_needs_opt_in() {
    let mut bytes = vec![b'P', b'K', 0x07, 0x08];
    bytes.extend_from_slice(&archive_with(&[("a", b"b")]));

    let err = bytes.as_slice().stream_zip_entries().unwrap_err();
    assert!(matches!(
        err,
        Error::Unsupported(UnsupportedError::Splitting)
    ));

    let options = ReadOptions {
        skip_split_signature: true,
        ..ReadOptions::default()
    };
    let mut reader = bytes
        .as_slice()
        .stream_zip_entries_with_options(options)
        .unwrap()
        .expect("one entry");
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"b");
}

#[test]
fn unsupported_methods_are_reported() {
    // method 12 (bzip2) is detected, not decoded
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&20u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&12u16.to_le_bytes());
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.push(b'x');
    bytes.extend_from_slice(&[0u8; 4]);

    let err = bytes.as_slice().stream_zip_entries().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Unsupported(UnsupportedError::MethodNotSupported(Method::Bzip2))
        ),
        "got {err:?}"
    );
}

#[test]
fn encrypted_entries_are_detected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&20u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // bit 0: encrypted
    bytes.extend_from_slice(&8u16.to_le_bytes());
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.push(b'x');
    bytes.extend_from_slice(&[0u8; 10]);

    let err = bytes.as_slice().stream_zip_entries().unwrap_err();
    assert!(matches!(
        err,
        Error::Unsupported(UnsupportedError::Encrypted)
    ));
}

// pack 9-bit LZW codes LSB-first, the layout of shrunk entries
fn pack_shrunk(codes: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut acc = 0u64;
    let mut bits = 0u32;
    for &code in codes {
        acc |= code << bits;
        bits += 9;
        while bits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push(acc as u8);
    }
    out
}

#[test_log::test]
fn shrunk_entries_decode_end_to_end() {
    // codes: 'a', 'b', then the entry for "ab"
    let content = b"abab";
    let packed = pack_shrunk(&[97, 98, 257]);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&10u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // method: shrink
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(content).to_le_bytes());
    bytes.extend_from_slice(&(packed.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&8u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(b"old.text");
    bytes.extend_from_slice(&packed);
    // terminal record so the stream ends cleanly
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0u8; 18]);

    let mut reader = bytes
        .as_slice()
        .stream_zip_entries()
        .unwrap()
        .expect("one entry");
    assert_eq!(reader.entry().method, Method::Shrink);
    let mut read_back = Vec::new();
    reader.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, content);
}
