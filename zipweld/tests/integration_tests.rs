use std::cmp;

use zipweld::{
    fsm::{ArchiveFsm, EntryFsm, FsmResult},
    options::ReadOptions,
    parse::Method,
};

// A minimal single-entry archive: "a.txt" stored, contents "abc".
fn stored_archive() -> Vec<u8> {
    let name = b"a.txt";
    let content = b"abc";
    let crc = crc32fast::hash(content);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&10u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(content);

    let cd_offset = bytes.len() as u32;
    bytes.extend_from_slice(b"PK\x01\x02");
    bytes.extend_from_slice(&0x0014u16.to_le_bytes()); // made by
    bytes.extend_from_slice(&10u16.to_le_bytes()); // needed
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0x2199_5A21u32.to_le_bytes());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&[0u8; 8]); // extra, comment, disk, internal
    bytes.extend_from_slice(&0u32.to_le_bytes()); // external
    bytes.extend_from_slice(&0u32.to_le_bytes()); // header offset
    bytes.extend_from_slice(name);
    let cd_size = bytes.len() as u32 - cd_offset;

    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0u8; 4]);
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&cd_size.to_le_bytes());
    bytes.extend_from_slice(&cd_offset.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes
}

#[test]
fn state_machine_reads_the_central_directory() {
    let bytes = stored_archive();

    let mut fsm = ArchiveFsm::new(bytes.len() as u64);

    let archive = 'read_zip: loop {
        if let Some(offset) = fsm.wants_read() {
            // feed in small increments, the machine must cope
            let increment = 128usize;
            let offset = offset as usize;
            let slice = if offset + increment > bytes.len() {
                &bytes[offset..]
            } else {
                &bytes[offset..offset + increment]
            };

            let len = cmp::min(slice.len(), fsm.space().len());
            fsm.space()[..len].copy_from_slice(&slice[..len]);
            match len {
                0 => panic!("EOF!"),
                read_bytes => {
                    fsm.fill(read_bytes);
                }
            }
        }

        fsm = match fsm.process() {
            Ok(res) => match res {
                FsmResult::Continue(fsm) => fsm,
                FsmResult::Done(archive) => break 'read_zip archive,
            },
            Err(err) => {
                panic!("{}", err)
            }
        }
    };

    assert_eq!(archive.entries().count(), 1);
    let entry = archive.by_name("a.txt").unwrap();
    assert_eq!(entry.method, Method::Store);
    assert_eq!(entry.uncompressed_size, 3);
    assert_eq!(entry.crc32, crc32fast::hash(b"abc"));
    assert_eq!(entry.header_offset, 0);
}

#[test]
fn entry_state_machine_decodes_one_byte_at_a_time() {
    let bytes = stored_archive();

    // read the archive first to get the entry metadata
    let mut fsm = ArchiveFsm::new(bytes.len() as u64);
    let archive = loop {
        if let Some(offset) = fsm.wants_read() {
            let offset = offset as usize;
            let len = cmp::min(bytes.len() - offset, fsm.space().len());
            fsm.space()[..len].copy_from_slice(&bytes[offset..offset + len]);
            fsm.fill(len);
        }
        match fsm.process().unwrap() {
            FsmResult::Continue(next) => fsm = next,
            FsmResult::Done(archive) => break archive,
        }
    };
    let entry = archive.by_name("a.txt").unwrap().clone();

    // now decode the entry, feeding one byte per turn
    let mut input = &bytes[entry.header_offset as usize..];
    let mut fsm = EntryFsm::new(Some(entry), ReadOptions::default());
    let mut content = Vec::new();
    loop {
        if fsm.wants_read() {
            let n = cmp::min(1, input.len());
            fsm.space()[..n].copy_from_slice(&input[..n]);
            fsm.fill(n);
            input = &input[n..];
        }

        let mut out = [0u8; 64];
        match fsm.process(&mut out).unwrap() {
            FsmResult::Continue((next, outcome)) => {
                content.extend_from_slice(&out[..outcome.bytes_written]);
                fsm = next;
            }
            FsmResult::Done(_) => break,
        }
    }
    assert_eq!(content, b"abc");
}
