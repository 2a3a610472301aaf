use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::parse::{
    Entry, ExtraField, ExtraResourceAlignmentField, HostSystem, Method, UnixMode,
};

/// Describes an entry to be written to an archive.
///
/// Mutable until handed to a writer; the writer freezes it when the entry is
/// closed. Most fields have sensible defaults: deflate compression, the
/// current time, no comment, FAT host attributes.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    name: String,
    method: Option<Method>,
    modified: DateTime<Utc>,
    comment: Option<String>,
    internal_attrs: u16,
    external_attrs: u32,
    host_system: HostSystem,
    alignment: u16,
    extra_fields: Vec<ExtraField>,
    known_size: Option<u64>,
    known_crc32: Option<u32>,
}

impl EntrySpec {
    /// Create a spec for an entry with the given name.
    ///
    /// Backslashes are normalized to forward slashes: FAT-derived tooling
    /// produces them, the zip format wants `/`. A name ending in `/` denotes
    /// a directory.
    pub fn new(name: impl Into<String>) -> Self {
        let mut spec = Self {
            name: String::new(),
            method: None,
            modified: Utc::now(),
            comment: None,
            internal_attrs: 0,
            external_attrs: 0,
            host_system: HostSystem::MsDos,
            alignment: 0,
            extra_fields: Vec::new(),
            known_size: None,
            known_crc32: None,
        };
        spec.set_name(name);
        spec
    }

    /// Set the entry name, normalizing backslashes to forward slashes.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into().replace('\\', "/");
    }

    /// The (normalized) entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the name ends with `/`.
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Set the compression method. When unset, the writer's default applies.
    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    /// The requested compression method, if any.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Set the last-modified time. It is stored with 2-second precision;
    /// attach an [ExtraField::Timestamp] for more.
    pub fn set_modified(&mut self, modified: DateTime<Utc>) {
        self.modified = modified;
    }

    /// The last-modified time.
    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Set the per-entry comment.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    /// The per-entry comment, if any.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Set internal attributes (bit 0 marks apparent text files).
    pub fn set_internal_attrs(&mut self, attrs: u16) {
        self.internal_attrs = attrs;
    }

    /// Internal attributes.
    pub fn internal_attrs(&self) -> u16 {
        self.internal_attrs
    }

    /// Set raw external attributes; also consider [Self::set_unix_mode].
    pub fn set_external_attrs(&mut self, attrs: u32) {
        self.external_attrs = attrs;
    }

    /// External attributes.
    pub fn external_attrs(&self) -> u32 {
        self.external_attrs
    }

    /// Mark the entry as created on a Unix host with the given file mode
    /// (type and permission bits, e.g. `0o100644`).
    pub fn set_unix_mode(&mut self, mode: u32) {
        let mode = if mode & UnixMode::IFMT.0 == 0 {
            let kind = if self.is_directory() {
                UnixMode::IFDIR.0
            } else {
                UnixMode::IFREG.0
            };
            mode | kind
        } else {
            mode
        };
        self.host_system = HostSystem::Unix;
        self.external_attrs = mode << 16;
    }

    /// The host system recorded in "version made by".
    pub fn host_system(&self) -> HostSystem {
        self.host_system
    }

    /// Set the host system recorded in "version made by".
    pub fn set_host_system(&mut self, host_system: HostSystem) {
        self.host_system = host_system;
    }

    /// Request that the entry's data start at a multiple of `alignment`
    /// bytes. Must be zero, or a power of two no larger than 0x8000.
    pub fn set_alignment(&mut self, alignment: u16) -> Result<(), Error> {
        if alignment > 1 && (!alignment.is_power_of_two() || alignment > 0x8000) {
            return Err(Error::BadArgument(
                "alignment must be a power of two, at most 0x8000",
            ));
        }
        self.alignment = alignment;
        Ok(())
    }

    /// The requested data alignment: 0 or 1 mean none.
    pub fn alignment(&self) -> u16 {
        match self
            .extra_fields
            .iter()
            .find_map(|f| match f {
                ExtraField::ResourceAlignment(a) => Some(a.alignment),
                _ => None,
            }) {
            Some(a) if a > self.alignment => a,
            _ => self.alignment,
        }
    }

    /// Declare the entry's uncompressed size up front. Required for STORED
    /// entries going to non-seekable sinks; it is also how entries that may
    /// exceed 4 GiB announce themselves, so the writer can budget a zip64
    /// extra in the local header, and what `Never`-mode zip64 validation
    /// checks before any data is written.
    pub fn set_size(&mut self, size: u64) {
        self.known_size = Some(size);
    }

    /// The declared uncompressed size, if any.
    pub fn size(&self) -> Option<u64> {
        self.known_size
    }

    /// Declare the entry's CRC-32 up front (STORED to non-seekable sinks).
    pub fn set_crc32(&mut self, crc32: u32) {
        self.known_crc32 = Some(crc32);
    }

    /// The declared CRC-32, if any.
    pub fn crc32(&self) -> Option<u32> {
        self.known_crc32
    }

    /// The entry's extra fields, in the order they will be written.
    pub fn extra_fields(&self) -> &[ExtraField] {
        &self.extra_fields
    }

    /// Add an extra field. A field with the same header id is replaced in
    /// place; otherwise the field is appended (but always before a trailing
    /// [ExtraField::Unparseable] block).
    pub fn add_extra_field(&mut self, field: ExtraField) {
        if let Some(tag) = field.tag() {
            if let Some(existing) = self
                .extra_fields
                .iter_mut()
                .find(|f| f.tag() == Some(tag))
            {
                *existing = field;
                return;
            }
        }
        let at = match self.extra_fields.last() {
            Some(ExtraField::Unparseable { .. }) => self.extra_fields.len() - 1,
            _ => self.extra_fields.len(),
        };
        self.extra_fields.insert(at, field);
    }

    /// Add an extra field at the head of the list, replacing any existing
    /// field with the same header id first.
    pub fn add_extra_field_first(&mut self, field: ExtraField) {
        if let Some(tag) = field.tag() {
            self.extra_fields.retain(|f| f.tag() != Some(tag));
        }
        self.extra_fields.insert(0, field);
    }

    /// Remove the extra field with the given header id; fails if absent.
    pub fn remove_extra_field(&mut self, tag: u16) -> Result<ExtraField, Error> {
        let idx = self
            .extra_fields
            .iter()
            .position(|f| f.tag() == Some(tag))
            .ok_or(Error::BadArgument("no extra field with that header id"))?;
        Ok(self.extra_fields.remove(idx))
    }

    /// Look up an extra field by header id.
    pub fn extra_field(&self, tag: u16) -> Option<&ExtraField> {
        self.extra_fields.iter().find(|f| f.tag() == Some(tag))
    }

    /// The resource-alignment extra field, if one is attached.
    pub fn resource_alignment(&self) -> Option<&ExtraResourceAlignmentField> {
        self.extra_fields.iter().find_map(|f| match f {
            ExtraField::ResourceAlignment(a) => Some(a),
            _ => None,
        })
    }
}

impl From<&Entry> for EntrySpec {
    /// Build a spec from an entry read out of another archive, keeping its
    /// metadata: this is the raw-copy path.
    fn from(entry: &Entry) -> Self {
        let mut spec = EntrySpec::new(entry.name.clone());
        spec.method = Some(entry.method);
        spec.modified = entry.modified;
        spec.comment = entry.comment.clone();
        spec.internal_attrs = entry.internal_attrs;
        spec.external_attrs = entry.external_attrs;
        spec.host_system = entry.creator_version.host_system;
        spec.known_size = Some(entry.uncompressed_size);
        spec.known_crc32 = Some(entry.crc32);
        // zip64 bookkeeping is the writer's business, everything else is
        // carried over
        spec.extra_fields = entry
            .extra_fields
            .iter()
            .filter(|f| f.tag() != Some(0x0001))
            .cloned()
            .collect();
        spec
    }
}
