use crate::bitstream::{BitOrder, BitReader};
use crate::error::Error;
use crate::parse::Method;

use super::{DecompressOutcome, Decompressor, HasMoreInput};

const CLEAR_CODE: usize = 256;
const INITIAL_CODE_SIZE: u32 = 9;
const MAX_CODE_SIZE: u32 = 13;
const MAX_TABLE_SIZE: usize = 1 << MAX_CODE_SIZE;
const UNUSED: i32 = -1;

/// Decoder for method 1, "shrinking": dynamic LZW with a variable code size
/// and a *partial clear* instead of a full table reset.
///
/// The code 256 is a control escape: followed by sub-code 1 it widens codes
/// by one bit, followed by sub-code 2 it frees every leaf entry of the table
/// so their slots can be reused.
pub(crate) struct ShrinkDec {
    bits: BitReader,
    code_size: u32,

    prefixes: Vec<i32>,
    characters: Vec<u8>,
    is_used: Vec<bool>,

    /// scan cursor for the next free slot
    table_size: usize,

    previous_code: Option<usize>,
    previous_first_char: u8,

    /// a clear code was read but its sub-code wasn't available yet
    awaiting_sub_code: bool,

    /// pending output; the top of the stack is the next byte to emit
    stack: Vec<u8>,

    /// total bytes produced (including what's still on the stack)
    produced: u64,

    /// the entry's uncompressed size, when known: decoding stops there so
    /// bit-level padding at the end of the stream is not read as codes
    expected: Option<u64>,

    done: bool,
}

impl ShrinkDec {
    pub(crate) fn new(uncompressed_size: Option<u64>) -> Self {
        let mut prefixes = vec![UNUSED; MAX_TABLE_SIZE];
        let mut characters = vec![0u8; MAX_TABLE_SIZE];
        let mut is_used = vec![false; MAX_TABLE_SIZE];
        for i in 0..=255usize {
            prefixes[i] = UNUSED;
            characters[i] = i as u8;
            is_used[i] = true;
        }
        // the clear code's slot is never allocated
        is_used[CLEAR_CODE] = true;

        Self {
            bits: BitReader::new(BitOrder::LsbFirst),
            code_size: INITIAL_CODE_SIZE,
            prefixes,
            characters,
            is_used,
            table_size: CLEAR_CODE + 1,
            previous_code: None,
            previous_first_char: 0,
            awaiting_sub_code: false,
            stack: Vec::with_capacity(MAX_TABLE_SIZE),
            produced: 0,
            expected: uncompressed_size,
            done: false,
        }
    }

    fn corrupt(msg: &str) -> Error {
        Error::Decompression {
            method: Method::Shrink,
            msg: msg.to_string(),
        }
    }

    /// Find a free slot and fill it. Returns None when the table is full.
    fn add_entry(&mut self, prefix: usize, character: u8) -> Option<usize> {
        while self.table_size < MAX_TABLE_SIZE && self.is_used[self.table_size] {
            self.table_size += 1;
        }
        if self.table_size >= MAX_TABLE_SIZE {
            return None;
        }
        let idx = self.table_size;
        self.prefixes[idx] = prefix as i32;
        self.characters[idx] = character;
        self.is_used[idx] = true;
        self.table_size = idx + 1;
        Some(idx)
    }

    /// Free every entry above the clear code that is not the prefix of some
    /// other in-use entry, then rewind the allocation cursor.
    fn partial_clear(&mut self) {
        let mut is_parent = vec![false; MAX_TABLE_SIZE];
        for i in CLEAR_CODE + 1..MAX_TABLE_SIZE {
            if self.is_used[i] && self.prefixes[i] >= 0 {
                is_parent[self.prefixes[i] as usize] = true;
            }
        }
        for i in CLEAR_CODE + 1..MAX_TABLE_SIZE {
            if !is_parent[i] {
                self.is_used[i] = false;
                self.prefixes[i] = UNUSED;
            }
        }
        self.table_size = CLEAR_CODE + 1;
    }

    fn handle_sub_code(&mut self, sub_code: u64) -> Result<(), Error> {
        match sub_code {
            1 => {
                if self.code_size >= MAX_CODE_SIZE {
                    return Err(Self::corrupt("code size increase past 13 bits"));
                }
                self.code_size += 1;
                Ok(())
            }
            2 => {
                self.partial_clear();
                Ok(())
            }
            _ => Err(Self::corrupt("unknown clear sub-code")),
        }
    }

    /// Expand one content code onto the output stack.
    fn decode_code(&mut self, code: usize) -> Result<(), Error> {
        if code >= MAX_TABLE_SIZE {
            return Err(Self::corrupt("code out of range"));
        }

        let (effective, added_unfinished) = if self.is_used[code] {
            (code, false)
        } else {
            // the code refers to the entry about to be defined: emit the
            // previous sequence followed by its own first character
            let previous = self
                .previous_code
                .ok_or_else(|| Self::corrupt("first code is not in the table"))?;
            let idx = self
                .add_entry(previous, self.previous_first_char)
                .ok_or_else(|| Self::corrupt("code table overflow"))?;
            if idx != code {
                return Err(Self::corrupt("unexpected slot for speculative entry"));
            }
            (code, true)
        };

        let mut entry = effective as i32;
        let mut chain = 0usize;
        while entry >= 0 {
            self.stack.push(self.characters[entry as usize]);
            entry = self.prefixes[entry as usize];
            chain += 1;
            if chain > MAX_TABLE_SIZE {
                return Err(Self::corrupt("prefix chain cycle"));
            }
        }
        self.produced += chain as u64;
        let first_char = *self.stack.last().expect("chain is never empty");

        if let Some(previous) = self.previous_code {
            if !added_unfinished {
                // table full: the entry is simply not recorded
                let _ = self.add_entry(previous, first_char);
            }
        }
        self.previous_code = Some(effective);
        self.previous_first_char = first_char;
        Ok(())
    }

    fn drain_stack(&mut self, out: &mut [u8], written: &mut usize) {
        while *written < out.len() {
            match self.stack.pop() {
                Some(byte) => {
                    out[*written] = byte;
                    *written += 1;
                }
                None => break,
            }
        }
    }
}

impl Decompressor for ShrinkDec {
    fn decompress(
        &mut self,
        in_buf: &[u8],
        out: &mut [u8],
        _has_more_input: HasMoreInput,
    ) -> Result<DecompressOutcome, Error> {
        if self.done {
            // everything is decoded, swallow any padding
            return Ok(DecompressOutcome {
                bytes_read: in_buf.len(),
                bytes_written: 0,
            });
        }

        let mut input = in_buf;
        let mut written = 0usize;

        loop {
            self.drain_stack(out, &mut written);
            if written == out.len() && !self.stack.is_empty() {
                break;
            }
            if let Some(expected) = self.expected {
                if self.produced >= expected {
                    if self.stack.is_empty() {
                        self.done = true;
                        // discard bit-level padding at the end of the stream
                        input = &input[input.len()..];
                    }
                    break;
                }
            }

            if self.awaiting_sub_code {
                let Some(sub_code) = self.bits.read_bits(&mut input, self.code_size) else {
                    break;
                };
                self.handle_sub_code(sub_code)?;
                self.awaiting_sub_code = false;
                continue;
            }

            let Some(code) = self.bits.read_bits(&mut input, self.code_size) else {
                break;
            };
            if code as usize == CLEAR_CODE {
                self.awaiting_sub_code = true;
                continue;
            }
            self.decode_code(code as usize)?;
        }

        Ok(DecompressOutcome {
            bytes_read: in_buf.len() - input.len(),
            bytes_written: written,
        })
    }

    fn is_done(&self) -> bool {
        self.done && self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pack (value, width) pairs LSB-first, the way shrunk streams are laid out
    fn pack(codes: &[(u64, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut acc = 0u64;
        let mut bits = 0u32;
        for &(value, width) in codes {
            acc |= value << bits;
            bits += width;
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

    fn decode_all(dec: &mut ShrinkDec, input: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 1024];
        let outcome = dec
            .decompress(input, &mut out, HasMoreInput::No)
            .expect("valid stream");
        out.truncate(outcome.bytes_written);
        out
    }

    #[test]
    fn literal_codes_grow_the_table() {
        let input = pack(&[(97, 9), (98, 9), (257, 9)]);
        let mut dec = ShrinkDec::new(None);
        assert_eq!(decode_all(&mut dec, &input), b"abab");
    }

    #[test]
    fn speculative_entry_repeats_first_char() {
        // 'a' followed by the not-yet-defined code 257 decodes to "a" + "aa"
        let input = pack(&[(97, 9), (257, 9)]);
        let mut dec = ShrinkDec::new(None);
        assert_eq!(decode_all(&mut dec, &input), b"aaa");
    }

    #[test]
    fn clear_sub_code_one_widens_codes() {
        let input = pack(&[(97, 9), (256, 9), (1, 9), (98, 10), (257, 10)]);
        let mut dec = ShrinkDec::new(None);
        assert_eq!(decode_all(&mut dec, &input), b"abab");
        assert_eq!(dec.code_size, 10);
    }

    #[test]
    fn widening_past_13_bits_fails() {
        let mut codes = vec![(97u64, 9u32)];
        let mut width = 9;
        for _ in 0..5 {
            codes.push((256, width));
            codes.push((1, width));
            width += 1;
        }
        let input = pack(&codes);
        let mut dec = ShrinkDec::new(None);
        let mut out = vec![0u8; 64];
        assert!(dec.decompress(&input, &mut out, HasMoreInput::No).is_err());
    }

    #[test]
    fn partial_clear_frees_only_leaves() {
        // build a few entries: 257 = "ab", 258 = "bc", 259 = "abc" (child of 257)
        let input = pack(&[(97, 9), (98, 9), (99, 9), (257, 9), (99, 9)]);
        let mut dec = ShrinkDec::new(None);
        assert_eq!(decode_all(&mut dec, &input), b"abcabc");
        assert!(dec.is_used[257] && dec.is_used[258] && dec.is_used[259]);

        dec.partial_clear();

        // 257 is the prefix of 259, so it survives; 258 and 259 are leaves
        assert!(dec.is_used[257]);
        assert!(!dec.is_used[258] && !dec.is_used[259]);
        // the invariant: freed entries have no prefix left behind
        for i in CLEAR_CODE + 1..MAX_TABLE_SIZE {
            if !dec.is_used[i] {
                assert_eq!(dec.prefixes[i], UNUSED);
            }
        }
        assert_eq!(dec.table_size, CLEAR_CODE + 1);

        // freed slots are recycled in order
        assert_eq!(dec.add_entry(97, b'x'), Some(258));
    }

    #[test]
    fn output_stack_survives_tiny_out_buffers() {
        let input = pack(&[(97, 9), (257, 9)]);
        let mut dec = ShrinkDec::new(None);
        let mut collected = Vec::new();
        let mut input_slice = &input[..];
        loop {
            let mut out = [0u8; 1];
            let outcome = dec
                .decompress(input_slice, &mut out, HasMoreInput::No)
                .unwrap();
            input_slice = &input_slice[outcome.bytes_read..];
            if outcome.bytes_written == 0 {
                break;
            }
            collected.extend_from_slice(&out[..outcome.bytes_written]);
        }
        assert_eq!(collected, b"aaa");
    }
}
