//! Character encodings used in ZIP files.
//!
//! ZIP entry paths may be encoded in a variety of character encodings:
//! historically, CP-437 was used, but many modern zip files use UTF-8 with an
//! optional UTF-8 flag.
//!
//! Others use the system's local character encoding, and we have no choice but
//! to make an educated guess thanks to the chardet-ng crate.
//!
//! On the write side, names and comments have to go the other way: encoding
//! can fail for code points the target charset has no mapping for, in which
//! case the replacement mode substitutes a 6-character `%UXXXX` escape for
//! each un-encodable UTF-16 code unit.

use std::fmt;

/// Encodings supported by this crate
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Encoding {
    /// [UTF-8](https://en.wikipedia.org/wiki/UTF-8), opt-in for ZIP files.
    Utf8,

    /// [Codepage 437](https://en.wikipedia.org/wiki/Code_page_437), also known as
    /// OEM-US, PC-8, or DOS Latin US.
    ///
    /// This is the fallback if UTF-8 is not specified and no other encoding
    /// is auto-detected. It was the original encoding of the zip format.
    Cp437,

    /// [Shift JIS](https://en.wikipedia.org/wiki/Shift_JIS), also known as SJIS.
    ///
    /// Still in use by some Japanese users as of 2019.
    ShiftJis,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Encoding as T;
        match self {
            T::Utf8 => write!(f, "utf-8"),
            T::Cp437 => write!(f, "cp-437"),
            T::ShiftJis => write!(f, "shift-jis"),
        }
    }
}

/// Errors encountered while converting text to UTF-8.
#[derive(Debug)]
pub enum DecodingError {
    /// Text claimed to be UTF-8, but wasn't (as far as we can tell).
    Utf8Error(std::str::Utf8Error),

    /// Text is too large to be converted.
    ///
    /// In practice, this happens if the text's length is larger than
    /// [usize::MAX], which seems unlikely.
    StringTooLarge,

    /// Text is not valid in the given encoding.
    EncodingError(&'static str),

    /// Text contains code points the target encoding has no mapping for
    /// (strict encode mode only).
    Unmappable(char),
}

impl From<std::str::Utf8Error> for DecodingError {
    fn from(e: std::str::Utf8Error) -> Self {
        DecodingError::Utf8Error(e)
    }
}

impl fmt::Display for DecodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8Error(utf8) => write!(f, "invalid utf-8: {utf8}"),
            Self::StringTooLarge => f.write_str("text too large to be converted"),
            Self::EncodingError(enc) => write!(f, "encoding error: {enc}"),
            Self::Unmappable(c) => write!(f, "character {c:?} cannot be encoded"),
        }
    }
}

impl std::error::Error for DecodingError {}

impl Encoding {
    /// Look up an encoding by label, accepting every alias `encoding_rs`
    /// knows about: "UTF8", "utf-8", "unicode-1-1-utf-8" all map to
    /// [Encoding::Utf8], "ibm437"/"cp437" to [Encoding::Cp437], and so on.
    ///
    /// Archives in the wild are produced with all of those spellings, so
    /// UTF-8 detection must be alias-aware rather than a string compare.
    pub fn for_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        if trimmed.eq_ignore_ascii_case("utf8") {
            // encoding_rs doesn't consider bare "utf8" a label, but zip
            // tooling does use it
            return Some(Encoding::Utf8);
        }
        if trimmed.eq_ignore_ascii_case("cp437")
            || trimmed.eq_ignore_ascii_case("ibm437")
            || trimmed.eq_ignore_ascii_case("437")
        {
            return Some(Encoding::Cp437);
        }
        let enc = encoding_rs::Encoding::for_label(trimmed.as_bytes())?;
        if enc == encoding_rs::UTF_8 {
            Some(Encoding::Utf8)
        } else if enc == encoding_rs::SHIFT_JIS {
            Some(Encoding::ShiftJis)
        } else {
            None
        }
    }

    /// True if this encoding is UTF-8; entries written with it get the
    /// language-encoding general-purpose bit.
    pub fn is_utf8(&self) -> bool {
        matches!(self, Encoding::Utf8)
    }

    pub(crate) fn decode(&self, i: &[u8]) -> Result<String, DecodingError> {
        match self {
            Encoding::Utf8 => {
                let s = std::str::from_utf8(i)?;
                Ok(s.to_string())
            }
            Encoding::Cp437 => Ok(oem_cp::decode_string_complete_table(
                i,
                &oem_cp::code_table::DECODING_TABLE_CP437,
            )),
            Encoding::ShiftJis => self.decode_as(i, encoding_rs::SHIFT_JIS),
        }
    }

    pub(crate) fn decode_vec(&self, v: Vec<u8>) -> Result<String, DecodingError> {
        if *self == Encoding::Utf8 {
            String::from_utf8(v).map_err(|e| e.utf8_error().into())
        } else {
            self.decode(&v)
        }
    }

    /// Replacement-mode decode: malformed sequences become '?' instead of
    /// failing.
    pub fn decode_lossy(&self, i: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(i).replace('\u{FFFD}', "?"),
            Encoding::Cp437 => oem_cp::decode_string_complete_table(
                i,
                &oem_cp::code_table::DECODING_TABLE_CP437,
            ),
            Encoding::ShiftJis => {
                let (cow, _, _) = encoding_rs::SHIFT_JIS.decode(i);
                cow.replace('\u{FFFD}', "?")
            }
        }
    }

    fn decode_as(
        &self,
        i: &[u8],
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<String, DecodingError> {
        let mut decoder = encoding.new_decoder();
        let len = decoder
            .max_utf8_buffer_length(i.len())
            .ok_or(DecodingError::StringTooLarge)?;
        let mut v = vec![0u8; len];
        let last = true;
        let (_decoder_result, _decoder_read, decoder_written, had_errors) =
            decoder.decode_to_utf8(i, &mut v, last);
        if had_errors {
            return Err(DecodingError::EncodingError(encoding.name()));
        }
        v.resize(decoder_written, 0u8);
        Ok(unsafe { String::from_utf8_unchecked(v) })
    }

    /// True if every character of `s` has a mapping in this encoding.
    pub fn can_encode(&self, s: &str) -> bool {
        match self {
            Encoding::Utf8 => true,
            _ => s.chars().all(|c| self.encode_char(c).is_some()),
        }
    }

    /// Strict encode: fails on the first un-encodable character.
    pub fn encode(&self, s: &str) -> Result<Vec<u8>, DecodingError> {
        match self {
            Encoding::Utf8 => Ok(s.as_bytes().to_vec()),
            _ => {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    match self.encode_char(c) {
                        Some(bytes) => out.extend_from_slice(&bytes.0[..bytes.1]),
                        None => return Err(DecodingError::Unmappable(c)),
                    }
                }
                Ok(out)
            }
        }
    }

    /// Replacement-mode encode: un-encodable code units become a 6-character
    /// `%UXXXX` escape (uppercase hex), one per UTF-16 code unit.
    pub fn encode_with_fallback(&self, s: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => s.as_bytes().to_vec(),
            _ => {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    match self.encode_char(c) {
                        Some(bytes) => out.extend_from_slice(&bytes.0[..bytes.1]),
                        None => {
                            let mut units = [0u16; 2];
                            for unit in c.encode_utf16(&mut units) {
                                use std::io::Write;
                                write!(&mut out, "%U{:04X}", unit).unwrap();
                            }
                        }
                    }
                }
                out
            }
        }
    }

    // Returns up to 4 bytes and the number of valid ones, or None if the
    // character has no mapping.
    fn encode_char(&self, c: char) -> Option<([u8; 4], usize)> {
        match self {
            Encoding::Utf8 => {
                let mut buf = [0u8; 4];
                let len = c.encode_utf8(&mut buf).len();
                Some((buf, len))
            }
            Encoding::Cp437 => {
                if c.is_ascii() {
                    return Some(([c as u8, 0, 0, 0], 1));
                }
                let mut src = [0u8; 4];
                let s = c.encode_utf8(&mut src);
                let v =
                    oem_cp::encode_string_checked(s, &oem_cp::code_table::ENCODING_TABLE_CP437)?;
                let b = *v.first()?;
                Some(([b, 0, 0, 0], 1))
            }
            Encoding::ShiftJis => {
                let mut src = [0u8; 4];
                let s = c.encode_utf8(&mut src);
                let (cow, _, had_errors) = encoding_rs::SHIFT_JIS.encode(s);
                if had_errors {
                    return None;
                }
                let mut buf = [0u8; 4];
                buf[..cow.len()].copy_from_slice(&cow);
                Some((buf, cow.len()))
            }
        }
    }
}

pub(crate) fn is_entry_non_utf8(name: &[u8], comment: &[u8], flags: u16) -> bool {
    let (valid1, require1) = detect_utf8(name);
    let (valid2, require2) = detect_utf8(comment);
    if !valid1 || !valid2 {
        // definitely not utf-8
        return true;
    }

    if !require1 && !require2 {
        // name and comment only use single-byte runes that overlap with UTF-8
        return false;
    }

    // Might be UTF-8, might be some other encoding; preserve existing flag.
    // Some ZIP writers use UTF-8 encoding without setting the UTF-8 flag.
    // Since it is impossible to always distinguish valid UTF-8 from some
    // other encoding (e.g., GBK or Shift-JIS), we trust the flag.
    flags & 0x800 == 0
}

// detect_utf8 reports whether s is a valid UTF-8 string, and whether the string
// must be considered UTF-8 encoding (i.e., not compatible with CP-437, ASCII,
// or any other common encoding).
pub(crate) fn detect_utf8(input: &[u8]) -> (bool, bool) {
    match std::str::from_utf8(input) {
        Err(_) => {
            // not valid utf-8
            (false, false)
        }
        Ok(s) => {
            let mut require = false;

            // Officially, ZIP uses CP-437, but many readers use the system's
            // local character encoding. Most encoding are compatible with a large
            // subset of CP-437, which itself is ASCII-like.
            //
            // Forbid 0x7e and 0x5c since EUC-KR and Shift-JIS replace those
            // characters with localized currency and overline characters.
            for c in s.chars() {
                if c < 0x20 as char || c > 0x7d as char || c == 0x5c as char {
                    require = true
                }
            }
            (true, require)
        }
    }
}
