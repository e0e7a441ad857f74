use crate::RawRecord;
use std::borrow::Cow;

pub use cachesim::{CacheEntry, CacheName, CacheParams, CacheSim, CacheSimKind};
pub use testcase::{ConcreteInput, TestCase};

/// Number of bytes in the [`Header`] that prefixes every record.
pub const HEADER_SIZE: usize = 22;

/// Largest payload a record can carry, bounded by the one byte `size` field of the header.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Width of the zero padded name buffer of a [`ModuleLoad`] record.
pub const MODULE_NAME_LEN: usize = 32;

/// Enumeration of possible record types.
///
/// This type corresponds to the `kind` byte of the record [`Header`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    ModuleLoad = 0,
    ModuleUnload = 1,
    ProcessUnload = 2,
    Call = 3,
    Return = 4,
    TbStart = 5,
    TbEnd = 6,
    ModuleDesc = 7,
    Fork = 8,
    CacheSim = 9,
    TestCase = 10,
}

impl TryFrom<u8> for RecordKind {
    type Error = UnknownRecordKind;

    #[inline]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ModuleLoad),
            1 => Ok(Self::ModuleUnload),
            2 => Ok(Self::ProcessUnload),
            3 => Ok(Self::Call),
            4 => Ok(Self::Return),
            5 => Ok(Self::TbStart),
            6 => Ok(Self::TbEnd),
            7 => Ok(Self::ModuleDesc),
            8 => Ok(Self::Fork),
            9 => Ok(Self::CacheSim),
            10 => Ok(Self::TestCase),
            _ => Err(UnknownRecordKind(value)),
        }
    }
}

impl RecordKind {
    /// Returns true for the kinds whose payloads are carried as [`Opaque`] bytes.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::TbStart | Self::TbEnd | Self::ModuleDesc)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Fixed size prefix of every record.
///
/// # Format
///
/// `| timestamp: le64 | size: u8 | kind: u8 | context: le32 | pid: le64 |`
///
/// All fields are packed, there is no padding between the header and the payload. `size` is the
/// number of payload bytes that follow the header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    timestamp: u64,
    size: u8,
    kind: u8,
    context: u32,
    pid: u64,
}

impl Header {
    pub fn new(origin: Origin, kind: RecordKind, size: u8) -> Self {
        Self {
            timestamp: origin.timestamp,
            size,
            kind: kind as u8,
            context: origin.context,
            pid: origin.pid,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the number of payload bytes following the header.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn kind(&self) -> Result<RecordKind, UnknownRecordKind> {
        RecordKind::try_from(self.kind)
    }

    /// Returns the execution context the record was produced in.
    pub fn context(&self) -> u32 {
        self.context
    }

    /// Returns the process (address space) the record was produced in.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn origin(&self) -> Origin {
        Origin {
            timestamp: self.timestamp,
            context: self.context,
            pid: self.pid,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let (timestamp, bytes) = parse_le64(bytes)?;
        let (size, bytes) = parse_u8(bytes)?;
        let (kind, bytes) = parse_u8(bytes)?;
        let (context, bytes) = parse_le32(bytes)?;
        let (pid, _) = parse_le64(bytes)?;
        Ok(Self {
            timestamp,
            size: size as u8,
            kind: kind as u8,
            context: context as u32,
            pid,
        })
    }

    fn write_into(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8] = self.size;
        bytes[9] = self.kind;
        bytes[10..14].copy_from_slice(&self.context.to_le_bytes());
        bytes[14..22].copy_from_slice(&self.pid.to_le_bytes());
    }
}

/// The header fields that are chosen by the writer rather than derived from the payload.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Origin {
    pub timestamp: u64,
    pub context: u32,
    pub pid: u64,
}

impl Origin {
    pub fn new(timestamp: u64, context: u32, pid: u64) -> Self {
        Self {
            timestamp,
            context,
            pid,
        }
    }
}

/// A parsed record payload corresponding to some event or metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Record<'d> {
    ModuleLoad(ModuleLoad),
    ModuleUnload(ModuleUnload),
    ProcessUnload,
    Call(Call),
    Return(Return),
    Fork(Fork),
    CacheSim(CacheSim),
    TestCase(TestCase<'d>),
    Opaque(Opaque<'d>),
}

impl<'d> Record<'d> {
    /// Returns the corresponding [`RecordKind`] for this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::ModuleLoad(_) => RecordKind::ModuleLoad,
            Self::ModuleUnload(_) => RecordKind::ModuleUnload,
            Self::ProcessUnload => RecordKind::ProcessUnload,
            Self::Call(_) => RecordKind::Call,
            Self::Return(_) => RecordKind::Return,
            Self::Fork(_) => RecordKind::Fork,
            Self::CacheSim(_) => RecordKind::CacheSim,
            Self::TestCase(_) => RecordKind::TestCase,
            Self::Opaque(record) => record.kind,
        }
    }

    /// Parses a [`RawRecord`] to produce a record.
    ///
    /// The header is validated against the framed bytes first: a `size` field that disagrees with
    /// the number of bytes following the header is reported as [`Error::PayloadSize`]. Payloads
    /// must be consumed exactly, extraneous bytes after a fixed size payload are an error.
    pub fn parse(raw: RawRecord<'d>) -> Result<Self, ParseError> {
        let header = raw.header()?;
        let payload = raw.payload();
        if header.size() != payload.len() {
            return Err(Error::PayloadSize {
                declared: header.size(),
                available: payload.len(),
            })?;
        }
        Self::parse_payload(header.kind()?, payload)
    }

    /// Parses the payload of a record of the given kind, without a header.
    pub fn parse_payload(kind: RecordKind, bytes: &'d [u8]) -> Result<Self, ParseError> {
        match kind {
            RecordKind::ModuleLoad => {
                let record = ModuleLoad::parse(bytes).map_err(|e| Error::wrap("modload", e))?;
                Ok(Self::ModuleLoad(record))
            }
            RecordKind::ModuleUnload => {
                let record =
                    ModuleUnload::parse(bytes).map_err(|e| Error::wrap("modunload", e))?;
                Ok(Self::ModuleUnload(record))
            }
            RecordKind::ProcessUnload => {
                expect_len(bytes, 0).map_err(|e| Error::wrap("procunload", e))?;
                Ok(Self::ProcessUnload)
            }
            RecordKind::Call => {
                let record = Call::parse(bytes).map_err(|e| Error::wrap("call", e))?;
                Ok(Self::Call(record))
            }
            RecordKind::Return => {
                let record = Return::parse(bytes).map_err(|e| Error::wrap("ret", e))?;
                Ok(Self::Return(record))
            }
            RecordKind::Fork => {
                let record = Fork::parse(bytes).map_err(|e| Error::wrap("fork", e))?;
                Ok(Self::Fork(record))
            }
            RecordKind::CacheSim => {
                let record = CacheSim::parse(bytes).map_err(|e| Error::wrap("cachesim", e))?;
                Ok(Self::CacheSim(record))
            }
            RecordKind::TestCase => {
                let record = TestCase::parse(bytes).map_err(|e| Error::wrap("testcase", e))?;
                Ok(Self::TestCase(record))
            }
            RecordKind::TbStart | RecordKind::TbEnd | RecordKind::ModuleDesc => {
                Ok(Self::Opaque(Opaque {
                    kind,
                    contents: Cow::from(bytes),
                }))
            }
        }
    }

    /// Write a serialized record, header followed by payload, into the provided buffer.
    ///
    /// The header's `size` field is computed from the payload. If the payload does not fit into
    /// [`MAX_PAYLOAD_SIZE`] bytes, or any of its own length fields overflow, an error is returned
    /// and `buffer` is left exactly as it was before the call.
    pub fn emit(&self, origin: Origin, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
        let start = buffer.len();
        buffer.resize(start + HEADER_SIZE, 0);

        if let Err(err) = self.emit_payload(buffer) {
            buffer.truncate(start);
            return Err(err);
        }

        let size = buffer.len() - start - HEADER_SIZE;
        if size > MAX_PAYLOAD_SIZE {
            buffer.truncate(start);
            return Err(Error::TooLarge {
                field: "record payload",
                len: size,
                max: MAX_PAYLOAD_SIZE,
            })?;
        }

        Header::new(origin, self.kind(), size as u8)
            .write_into(&mut buffer[start..start + HEADER_SIZE]);
        Ok(())
    }

    /// Write only the payload of this record into the provided buffer.
    ///
    /// Unlike [`Record::emit`] this is not limited by the header's `size` field, only by the
    /// payload's own length fields.
    pub fn emit_payload(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
        match self {
            Self::ModuleLoad(record) => record.emit(buffer)?,
            Self::ModuleUnload(record) => record.emit(buffer),
            Self::ProcessUnload => {}
            Self::Call(record) => record.emit(buffer),
            Self::Return(record) => record.emit(buffer),
            Self::Fork(record) => record.emit(buffer)?,
            Self::CacheSim(record) => record.emit(buffer)?,
            Self::TestCase(record) => record.emit(buffer)?,
            Self::Opaque(record) => {
                // Any other kind would be parsed with its own layout.
                if !record.kind.is_reserved() {
                    return Err(Error::BadData)?;
                }
                buffer.extend_from_slice(&record.contents)
            }
        }
        Ok(())
    }

    pub fn into_owned(self) -> Record<'static> {
        match self {
            Self::ModuleLoad(record) => Record::ModuleLoad(record),
            Self::ModuleUnload(record) => Record::ModuleUnload(record),
            Self::ProcessUnload => Record::ProcessUnload,
            Self::Call(record) => Record::Call(record),
            Self::Return(record) => Record::Return(record),
            Self::Fork(record) => Record::Fork(record),
            Self::CacheSim(record) => Record::CacheSim(record),
            Self::TestCase(record) => Record::TestCase(record.into_owned()),
            Self::Opaque(record) => Record::Opaque(record.into_owned()),
        }
    }
}

impl From<ModuleLoad> for Record<'_> {
    fn from(record: ModuleLoad) -> Self {
        Self::ModuleLoad(record)
    }
}

impl From<ModuleUnload> for Record<'_> {
    fn from(record: ModuleUnload) -> Self {
        Self::ModuleUnload(record)
    }
}

impl From<Call> for Record<'_> {
    fn from(record: Call) -> Self {
        Self::Call(record)
    }
}

impl From<Return> for Record<'_> {
    fn from(record: Return) -> Self {
        Self::Return(record)
    }
}

impl From<Fork> for Record<'_> {
    fn from(record: Fork) -> Self {
        Self::Fork(record)
    }
}

impl From<CacheSim> for Record<'_> {
    fn from(record: CacheSim) -> Self {
        Self::CacheSim(record)
    }
}

impl From<CacheParams> for Record<'_> {
    fn from(record: CacheParams) -> Self {
        Self::CacheSim(CacheSim::Params(record))
    }
}

impl From<CacheName> for Record<'_> {
    fn from(record: CacheName) -> Self {
        Self::CacheSim(CacheSim::Name(record))
    }
}

impl From<CacheEntry> for Record<'_> {
    fn from(record: CacheEntry) -> Self {
        Self::CacheSim(CacheSim::Entry(record))
    }
}

impl<'d> From<TestCase<'d>> for Record<'d> {
    fn from(record: TestCase<'d>) -> Self {
        Self::TestCase(record)
    }
}

impl<'d> From<Opaque<'d>> for Record<'d> {
    fn from(record: Opaque<'d>) -> Self {
        Self::Opaque(record)
    }
}

/// Record indicating that a module was mapped into a process.
///
/// # Format
///
/// `| name: [u8; 32] | load_base: le64 | native_base: le64 | size: le64 |`
///
/// The name is padded with zero bytes. A name of exactly 32 bytes has no terminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleLoad {
    name: String,
    load_base: u64,
    native_base: u64,
    size: u64,
}

impl ModuleLoad {
    const LEN: usize = MODULE_NAME_LEN + 24;

    pub fn new<S: Into<String>>(name: S, load_base: u64, native_base: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            load_base,
            native_base,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the address the module was loaded at in the traced process.
    pub fn load_base(&self) -> u64 {
        self.load_base
    }

    /// Returns the preferred base address from the module's image.
    pub fn native_base(&self) -> u64 {
        self.native_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, Self::LEN)?;
        let (name, bytes) = bytes.split_at(MODULE_NAME_LEN);
        let len = name
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(MODULE_NAME_LEN);
        let name = String::from_utf8(name[..len].to_vec())
            .map_err(|_| Error::record("Could not read module name", Error::BadData))?;
        let (load_base, bytes) = parse_le64(bytes)?;
        let (native_base, bytes) = parse_le64(bytes)?;
        let (size, _) = parse_le64(bytes)?;
        Ok(Self {
            name,
            load_base,
            native_base,
            size,
        })
    }

    fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
        let name = self.name.as_bytes();
        if name.len() > MODULE_NAME_LEN {
            return Err(Error::TooLarge {
                field: "module name",
                len: name.len(),
                max: MODULE_NAME_LEN,
            })?;
        }
        // A NUL would end the name early once the record is parsed again.
        if name.contains(&0) {
            return Err(Error::BadData)?;
        }
        let mut bytes = [0u8; Self::LEN];
        bytes[..name.len()].copy_from_slice(name);
        bytes[MODULE_NAME_LEN..MODULE_NAME_LEN + 8].copy_from_slice(&self.load_base.to_le_bytes());
        bytes[MODULE_NAME_LEN + 8..MODULE_NAME_LEN + 16]
            .copy_from_slice(&self.native_base.to_le_bytes());
        bytes[MODULE_NAME_LEN + 16..].copy_from_slice(&self.size.to_le_bytes());
        buffer.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Record indicating that the module loaded at `load_base` was unmapped.
///
/// # Format
///
/// `| load_base: le64 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModuleUnload {
    load_base: u64,
}

impl ModuleUnload {
    pub fn new(load_base: u64) -> Self {
        Self { load_base }
    }

    pub fn load_base(&self) -> u64 {
        self.load_base
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 8)?;
        let (load_base, _) = parse_le64(bytes)?;
        Ok(Self { load_base })
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.load_base.to_le_bytes());
    }
}

/// Record indicating a call from `source` to `target`.
///
/// # Format
///
/// `| source: le64 | target: le64 |`
///
/// Both addresses are absolute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    source: u64,
    target: u64,
}

impl Call {
    pub fn new(source: u64, target: u64) -> Self {
        Self { source, target }
    }

    /// Returns the address of the call instruction.
    pub fn source(&self) -> u64 {
        self.source
    }

    /// Returns the address of the called function.
    pub fn target(&self) -> u64 {
        self.target
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 16)?;
        let (source, bytes) = parse_le64(bytes)?;
        let (target, _) = parse_le64(bytes)?;
        Ok(Self { source, target })
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.source.to_le_bytes());
        buffer.extend_from_slice(&self.target.to_le_bytes());
    }
}

/// Record indicating a return from `source` to the caller that executed the call at `target`.
///
/// # Format
///
/// `| source: le64 | target: le64 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Return {
    source: u64,
    target: u64,
}

impl Return {
    pub fn new(source: u64, target: u64) -> Self {
        Self { source, target }
    }

    /// Returns the address of the return instruction.
    pub fn source(&self) -> u64 {
        self.source
    }

    /// Returns the address of the matching call instruction.
    pub fn target(&self) -> u64 {
        self.target
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 16)?;
        let (source, bytes) = parse_le64(bytes)?;
        let (target, _) = parse_le64(bytes)?;
        Ok(Self { source, target })
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.source.to_le_bytes());
        buffer.extend_from_slice(&self.target.to_le_bytes());
    }
}

/// Record indicating that an execution context forked into `children` at `pc`.
///
/// # Format
///
/// `| pc: le64 | count: le32 | children: [le32; count] |`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fork {
    pc: u64,
    children: Vec<u32>,
}

impl Fork {
    pub fn new(pc: u64, children: Vec<u32>) -> Self {
        Self { pc, children }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Returns the identifiers of the forked contexts in creation order.
    pub fn children(&self) -> &[u32] {
        &self.children
    }

    /// Parses a fork payload. The declared count must account for every remaining byte.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let (pc, bytes) = parse_le64(bytes)?;
        let (count, bytes) = parse_le32(bytes)?;
        let needed = (count as usize)
            .checked_mul(4)
            .ok_or(Error::NotEnoughBytes)?;
        expect_len(bytes, needed)?;
        let children = bytes
            .chunks_exact(4)
            .map(|child| parse_le32(child).map(|(child, _)| child as u32))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pc, children })
    }

    pub fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
        let count = u32::try_from(self.children.len()).map_err(|_| Error::TooLarge {
            field: "fork children",
            len: self.children.len(),
            max: u32::MAX as usize,
        })?;
        buffer.reserve(12 + 4 * self.children.len());
        buffer.extend_from_slice(&self.pc.to_le_bytes());
        buffer.extend_from_slice(&count.to_le_bytes());
        for child in &self.children {
            buffer.extend_from_slice(&child.to_le_bytes());
        }
        Ok(())
    }
}

/// Record whose payload layout is not interpreted by this crate.
///
/// The translation block and module description kinds are reserved by the format. Their
/// contents are carried verbatim so that tools can pass them through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Opaque<'d> {
    kind: RecordKind,
    contents: Cow<'d, [u8]>,
}

impl<'d> Opaque<'d> {
    /// Creates an opaque record. Only reserved kinds can be emitted, see
    /// [`RecordKind::is_reserved`].
    pub fn new<C: Into<Cow<'d, [u8]>>>(kind: RecordKind, contents: C) -> Self {
        Self {
            kind,
            contents: contents.into(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn into_owned(self) -> Opaque<'static> {
        Opaque {
            kind: self.kind,
            contents: Cow::from(self.contents.into_owned()),
        }
    }
}

pub mod cachesim {
    //! Cache simulation descriptors.
    //!
    //! Every descriptor starts with a one byte [`CacheSimKind`] selecting its layout.

    use super::{expect_len, parse_le32, parse_le64, parse_u8, EmitError, Error, ParseError};

    #[repr(u8)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum CacheSimKind {
        Params = 0,
        Name = 1,
        Entry = 2,
    }

    impl TryFrom<u8> for CacheSimKind {
        type Error = Error;

        fn try_from(value: u8) -> Result<Self, Self::Error> {
            match value {
                0 => Ok(Self::Params),
                1 => Ok(Self::Name),
                2 => Ok(Self::Entry),
                n => Err(Error::UnknownCacheSimKind(n)),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum CacheSim {
        Params(CacheParams),
        Name(CacheName),
        Entry(CacheEntry),
    }

    impl CacheSim {
        pub fn kind(&self) -> CacheSimKind {
            match self {
                Self::Params(_) => CacheSimKind::Params,
                Self::Name(_) => CacheSimKind::Name,
                Self::Entry(_) => CacheSimKind::Entry,
            }
        }

        pub(crate) fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
            let (kind, contents) = parse_u8(bytes)?;
            match CacheSimKind::try_from(kind as u8)? {
                CacheSimKind::Params => {
                    let record = CacheParams::parse(contents)
                        .map_err(|e| Error::wrap("cacheparams", e))?;
                    Ok(Self::Params(record))
                }
                CacheSimKind::Name => {
                    let record =
                        CacheName::parse(contents).map_err(|e| Error::wrap("cachename", e))?;
                    Ok(Self::Name(record))
                }
                CacheSimKind::Entry => {
                    let record =
                        CacheEntry::parse(contents).map_err(|e| Error::wrap("cacheentry", e))?;
                    Ok(Self::Entry(record))
                }
            }
        }

        pub(crate) fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
            match self {
                Self::Params(record) => record.emit(buffer),
                Self::Name(record) => record.emit(buffer)?,
                Self::Entry(record) => record.emit(buffer),
            }
            Ok(())
        }
    }

    /// Geometry of one simulated cache.
    ///
    /// # Format
    ///
    /// `| 0 | cache_id: le32 | size: le32 | line_size: le32 | associativity: le32 | upper_cache_id: le32 |`
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CacheParams {
        cache_id: u32,
        size: u32,
        line_size: u32,
        associativity: u32,
        upper_cache_id: u32,
    }

    impl CacheParams {
        pub fn new(
            cache_id: u32,
            size: u32,
            line_size: u32,
            associativity: u32,
            upper_cache_id: u32,
        ) -> Self {
            Self {
                cache_id,
                size,
                line_size,
                associativity,
                upper_cache_id,
            }
        }

        pub fn cache_id(&self) -> u32 {
            self.cache_id
        }

        pub fn size(&self) -> u32 {
            self.size
        }

        pub fn line_size(&self) -> u32 {
            self.line_size
        }

        pub fn associativity(&self) -> u32 {
            self.associativity
        }

        /// Returns the id of the next cache level.
        pub fn upper_cache_id(&self) -> u32 {
            self.upper_cache_id
        }

        fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
            expect_len(bytes, 20)?;
            let (cache_id, bytes) = parse_le32(bytes)?;
            let (size, bytes) = parse_le32(bytes)?;
            let (line_size, bytes) = parse_le32(bytes)?;
            let (associativity, bytes) = parse_le32(bytes)?;
            let (upper_cache_id, _) = parse_le32(bytes)?;
            Ok(Self {
                cache_id: cache_id as u32,
                size: size as u32,
                line_size: line_size as u32,
                associativity: associativity as u32,
                upper_cache_id: upper_cache_id as u32,
            })
        }

        fn emit(&self, buffer: &mut Vec<u8>) {
            buffer.push(CacheSimKind::Params as u8);
            for field in [
                self.cache_id,
                self.size,
                self.line_size,
                self.associativity,
                self.upper_cache_id,
            ] {
                buffer.extend_from_slice(&field.to_le_bytes());
            }
        }
    }

    /// Binds a numeric cache id to a human readable name.
    ///
    /// # Format
    ///
    /// `| 1 | id: le32 | length: le32 | name: [u8; length] |`
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct CacheName {
        id: u32,
        name: String,
    }

    impl CacheName {
        pub fn new<S: Into<String>>(id: u32, name: S) -> Self {
            Self {
                id,
                name: name.into(),
            }
        }

        pub fn id(&self) -> u32 {
            self.id
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
            let (id, bytes) = parse_le32(bytes)?;
            let (length, bytes) = parse_le32(bytes)?;
            expect_len(bytes, length as usize)?;
            let name = String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::record("Could not read cache name", Error::BadData))?;
            Ok(Self {
                id: id as u32,
                name,
            })
        }

        fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
            let length = u32::try_from(self.name.len()).map_err(|_| Error::TooLarge {
                field: "cache name",
                len: self.name.len(),
                max: u32::MAX as usize,
            })?;
            buffer.push(CacheSimKind::Name as u8);
            buffer.extend_from_slice(&self.id.to_le_bytes());
            buffer.extend_from_slice(&length.to_le_bytes());
            buffer.extend_from_slice(self.name.as_bytes());
            Ok(())
        }
    }

    /// One simulated memory access and the number of cache misses it produced.
    ///
    /// # Format
    ///
    /// `| 2 | cache_id: u8 | pc: le64 | address: le64 | size: u8 | is_write: u8 | is_code: u8 | miss_count: u8 |`
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CacheEntry {
        cache_id: u8,
        pc: u64,
        address: u64,
        size: u8,
        is_write: bool,
        is_code: bool,
        miss_count: u8,
    }

    impl CacheEntry {
        pub fn new(
            cache_id: u8,
            pc: u64,
            address: u64,
            size: u8,
            is_write: bool,
            is_code: bool,
            miss_count: u8,
        ) -> Self {
            Self {
                cache_id,
                pc,
                address,
                size,
                is_write,
                is_code,
                miss_count,
            }
        }

        pub fn cache_id(&self) -> u8 {
            self.cache_id
        }

        pub fn pc(&self) -> u64 {
            self.pc
        }

        pub fn address(&self) -> u64 {
            self.address
        }

        pub fn size(&self) -> u8 {
            self.size
        }

        pub fn is_write(&self) -> bool {
            self.is_write
        }

        pub fn is_code(&self) -> bool {
            self.is_code
        }

        pub fn miss_count(&self) -> u8 {
            self.miss_count
        }

        fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
            expect_len(bytes, 21)?;
            let (cache_id, bytes) = parse_u8(bytes)?;
            let (pc, bytes) = parse_le64(bytes)?;
            let (address, bytes) = parse_le64(bytes)?;
            let (size, bytes) = parse_u8(bytes)?;
            let (is_write, bytes) = parse_u8(bytes)?;
            let (is_code, bytes) = parse_u8(bytes)?;
            let (miss_count, _) = parse_u8(bytes)?;
            Ok(Self {
                cache_id: cache_id as u8,
                pc,
                address,
                size: size as u8,
                is_write: parse_flag(is_write)?,
                is_code: parse_flag(is_code)?,
                miss_count: miss_count as u8,
            })
        }

        fn emit(&self, buffer: &mut Vec<u8>) {
            buffer.push(CacheSimKind::Entry as u8);
            buffer.push(self.cache_id);
            buffer.extend_from_slice(&self.pc.to_le_bytes());
            buffer.extend_from_slice(&self.address.to_le_bytes());
            buffer.extend_from_slice(&[
                self.size,
                self.is_write as u8,
                self.is_code as u8,
                self.miss_count,
            ]);
        }
    }

    fn parse_flag(value: u64) -> Result<bool, ParseError> {
        match value {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::BadData)?,
        }
    }
}

pub mod testcase {
    //! Concrete inputs of a test case.
    //!
    //! # Format
    //!
    //! A flat sequence of tuples with no outer count:
    //!
    //! `| name_len: le32 | data_len: le32 | name: [u8; name_len] | data: [u8; data_len] |`
    //!
    //! A reader consumes tuples until the payload is exhausted, so every byte of the payload must
    //! belong to exactly one tuple.

    use super::{parse_le32, EmitError, Error, ParseError};
    use std::borrow::Cow;

    /// One named input and the concrete bytes that were chosen for it.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct ConcreteInput<'d> {
        name: Cow<'d, [u8]>,
        data: Cow<'d, [u8]>,
    }

    impl<'d> ConcreteInput<'d> {
        pub fn new<N, D>(name: N, data: D) -> Self
        where
            N: Into<Cow<'d, [u8]>>,
            D: Into<Cow<'d, [u8]>>,
        {
            Self {
                name: name.into(),
                data: data.into(),
            }
        }

        pub fn name(&self) -> &[u8] {
            &self.name
        }

        pub fn data(&self) -> &[u8] {
            &self.data
        }

        pub fn into_owned(self) -> ConcreteInput<'static> {
            ConcreteInput {
                name: Cow::from(self.name.into_owned()),
                data: Cow::from(self.data.into_owned()),
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
    pub struct TestCase<'d> {
        inputs: Vec<ConcreteInput<'d>>,
    }

    impl<'d> TestCase<'d> {
        pub fn new(inputs: Vec<ConcreteInput<'d>>) -> Self {
            Self { inputs }
        }

        pub fn inputs(&self) -> &[ConcreteInput<'d>] {
            &self.inputs
        }

        pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
            self.inputs.iter().map(|input| (input.name(), input.data()))
        }

        pub fn len(&self) -> usize {
            self.inputs.len()
        }

        pub fn is_empty(&self) -> bool {
            self.inputs.is_empty()
        }

        /// Parses a test case payload.
        ///
        /// Fails with [`Error::NotEnoughBytes`] as soon as a tuple header or body would extend
        /// past the end of `bytes`.
        pub fn parse(bytes: &'d [u8]) -> Result<Self, ParseError> {
            let mut inputs = Vec::new();
            let mut remaining = bytes;
            while !remaining.is_empty() {
                let (name_len, rest) = parse_le32(remaining)?;
                let (data_len, rest) = parse_le32(rest)?;
                let (name, rest) = take(rest, name_len as usize)?;
                let (data, rest) = take(rest, data_len as usize)?;
                inputs.push(ConcreteInput {
                    name: Cow::from(name),
                    data: Cow::from(data),
                });
                remaining = rest;
            }
            Ok(Self { inputs })
        }

        pub fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), EmitError> {
            // Validate everything up front so a failure never leaves a partial tuple behind.
            for input in &self.inputs {
                check_len("test case name", input.name.len())?;
                check_len("test case data", input.data.len())?;
            }
            for input in &self.inputs {
                buffer.extend_from_slice(&(input.name.len() as u32).to_le_bytes());
                buffer.extend_from_slice(&(input.data.len() as u32).to_le_bytes());
                buffer.extend_from_slice(&input.name);
                buffer.extend_from_slice(&input.data);
            }
            Ok(())
        }

        pub fn into_owned(self) -> TestCase<'static> {
            TestCase {
                inputs: self
                    .inputs
                    .into_iter()
                    .map(ConcreteInput::into_owned)
                    .collect(),
            }
        }
    }

    fn take(bytes: &[u8], len: usize) -> Result<(&[u8], &[u8]), ParseError> {
        if bytes.len() < len {
            return Err(Error::NotEnoughBytes)?;
        }
        Ok(bytes.split_at(len))
    }

    fn check_len(field: &'static str, len: usize) -> Result<(), EmitError> {
        if len > u32::MAX as usize {
            return Err(Error::TooLarge {
                field,
                len,
                max: u32::MAX as usize,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ParseError(#[from] Error);

impl ParseError {
    /// Returns the innermost error, skipping the record names added while unwinding.
    pub fn root(&self) -> &Error {
        self.0.root()
    }
}

impl From<UnknownRecordKind> for ParseError {
    fn from(err: UnknownRecordKind) -> Self {
        Self(Error::from(err))
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct EmitError(#[from] Error);

impl EmitError {
    pub fn root(&self) -> &Error {
        self.0.root()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse {0:} record")]
    ParseRecord(String, #[source] Box<Error>),

    #[error(transparent)]
    UnknownRecordKind(#[from] UnknownRecordKind),

    #[error("unknown cache simulation descriptor: {0:x}")]
    UnknownCacheSimKind(u8),

    #[error("record data does not contain enough bytes")]
    NotEnoughBytes,

    #[error("record data contains {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("header declares {declared} payload bytes but {available} are present")]
    PayloadSize { declared: usize, available: usize },

    #[error("Data present for record did not match the required format")]
    BadData,

    #[error("{field} is {len} bytes which exceeds the limit of {max}")]
    TooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

impl Error {
    fn record(s: &str, e: Error) -> Self {
        Self::ParseRecord(String::from(s), Box::new(e))
    }

    fn wrap(s: &str, e: ParseError) -> Self {
        Self::ParseRecord(String::from(s), Box::new(e.0))
    }

    pub fn root(&self) -> &Error {
        match self {
            Self::ParseRecord(_, inner) => inner.root(),
            err => err,
        }
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("unknown record kind: {0:x}")]
pub struct UnknownRecordKind(u8);

impl UnknownRecordKind {
    pub fn tag(&self) -> u8 {
        self.0
    }
}

macro_rules! generate_parse_func {
    ($name:ident,$ty:ty,$impl:expr) => {
        pub fn $name(bytes: &[u8]) -> Result<(u64, &[u8]), ParseError> {
            let mut buffer = [0u8; ::std::mem::size_of::<$ty>()];
            if bytes.len() < ::std::mem::size_of::<$ty>() {
                Err(Error::NotEnoughBytes)?;
            }
            let (left, right) = bytes.split_at(::std::mem::size_of::<$ty>());
            buffer.as_mut_slice().copy_from_slice(left);
            Ok(($impl(buffer) as _, right))
        }
    };
}

generate_parse_func!(parse_u8, u8, u8::from_le_bytes);
generate_parse_func!(parse_le32, u32, u32::from_le_bytes);
generate_parse_func!(parse_le64, u64, u64::from_le_bytes);

fn expect_len(bytes: &[u8], len: usize) -> Result<(), ParseError> {
    match bytes.len() {
        n if n < len => Err(Error::NotEnoughBytes)?,
        n if n > len => Err(Error::TrailingBytes(n - len))?,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: Record<'_>) -> Record<'static> {
        let mut buffer = Vec::new();
        record.emit(Origin::new(7, 2, 0x1000), &mut buffer).unwrap();
        let raw = RawRecord::new(&buffer);
        Record::parse(raw).unwrap().into_owned()
    }

    #[test]
    fn test_header_layout() {
        let mut buffer = Vec::new();
        Record::from(Call::new(0x401000, 0x402000))
            .emit(Origin::new(0x0102030405060708, 0xaabbccdd, 0x1122), &mut buffer)
            .unwrap();

        assert_eq!(buffer.len(), HEADER_SIZE + 16);
        assert_eq!(&buffer[..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buffer[8], 16);
        assert_eq!(buffer[9], RecordKind::Call as u8);
        assert_eq!(&buffer[10..14], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(&buffer[14..22], &[0x22, 0x11, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buffer[22..30], &0x401000u64.to_le_bytes());

        let header = Header::parse(&buffer).unwrap();
        assert_eq!(header.timestamp(), 0x0102030405060708);
        assert_eq!(header.size(), 16);
        assert_eq!(header.kind(), Ok(RecordKind::Call));
        assert_eq!(header.context(), 0xaabbccdd);
        assert_eq!(header.pid(), 0x1122);
    }

    #[test]
    fn test_module_load() {
        let record = Record::from(ModuleLoad::new("libc.so.6", 0x7f00_0000, 0x0, 0x1c_0000));
        assert_eq!(roundtrip(record.clone()), record);

        let full = "a".repeat(MODULE_NAME_LEN);
        let record = Record::from(ModuleLoad::new(full.as_str(), 1, 2, 3));
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn test_module_name_too_long() {
        let mut buffer = vec![0xffu8];
        let err = Record::from(ModuleLoad::new("b".repeat(MODULE_NAME_LEN + 1), 0, 0, 0))
            .emit(Origin::default(), &mut buffer)
            .unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TooLarge {
                len: 33,
                max: MODULE_NAME_LEN,
                ..
            }
        ));
        assert_eq!(buffer, vec![0xff]);
    }

    #[test]
    fn test_cachesim() {
        let params = Record::from(CacheParams::new(1, 32768, 64, 8, 2));
        assert_eq!(roundtrip(params.clone()), params);

        let name = Record::from(CacheName::new(1, "L1d"));
        assert_eq!(roundtrip(name.clone()), name);

        let entry = Record::from(CacheEntry::new(1, 0x401000, 0x7ffe_0010, 8, true, false, 2));
        assert_eq!(roundtrip(entry.clone()), entry);
    }

    #[test]
    fn test_unknown_cachesim_kind() {
        let err = Record::parse_payload(RecordKind::CacheSim, &[7, 0, 0]).unwrap_err();
        assert!(matches!(err.root(), Error::UnknownCacheSimKind(7)));
    }

    #[test]
    fn test_cache_name_length_mismatch() {
        let mut payload = vec![CacheSimKind::Name as u8];
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(b"L2");
        let err = Record::parse_payload(RecordKind::CacheSim, &payload).unwrap_err();
        assert!(matches!(err.root(), Error::NotEnoughBytes));
    }

    #[test]
    fn test_fixed_payload_with_trailing_bytes() {
        let err = Record::parse_payload(RecordKind::ModuleUnload, &[0u8; 9]).unwrap_err();
        assert!(matches!(err.root(), Error::TrailingBytes(1)));

        let err = Record::parse_payload(RecordKind::ProcessUnload, &[0u8]).unwrap_err();
        assert!(matches!(err.root(), Error::TrailingBytes(1)));
    }

    #[test]
    fn test_fork_count_mismatch() {
        let mut payload = Vec::new();
        Fork::new(0x1000, vec![1, 2, 3]).emit(&mut payload).unwrap();
        payload.truncate(payload.len() - 2);
        let err = Fork::parse(&payload).unwrap_err();
        assert!(matches!(err.root(), Error::NotEnoughBytes));

        let mut payload = Vec::new();
        Fork::new(0x1000, vec![1]).emit(&mut payload).unwrap();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let err = Fork::parse(&payload).unwrap_err();
        assert!(matches!(err.root(), Error::TrailingBytes(4)));
    }

    #[test]
    fn test_fork_too_large_for_header() {
        let children: Vec<u32> = (0..100).collect();
        let mut buffer = Vec::new();
        let err = Record::from(Fork::new(0, children))
            .emit(Origin::default(), &mut buffer)
            .unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TooLarge {
                len: 412,
                max: MAX_PAYLOAD_SIZE,
                ..
            }
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_opaque_passthrough() {
        let record = Record::from(Opaque::new(RecordKind::TbStart, vec![1u8, 2, 3]));
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn test_opaque_with_interpreted_kind() {
        let mut buffer = vec![0xaau8];
        let err = Record::from(Opaque::new(RecordKind::Call, vec![1u8]))
            .emit(Origin::default(), &mut buffer)
            .unwrap_err();
        assert!(matches!(err.root(), Error::BadData));
        assert_eq!(buffer, vec![0xaau8]);

        for kind in [RecordKind::TbEnd, RecordKind::ModuleDesc] {
            let record = Record::from(Opaque::new(kind, vec![9u8]));
            assert_eq!(roundtrip(record.clone()), record);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(RecordKind::try_from(11u8), Err(UnknownRecordKind(11)));
    }
}
