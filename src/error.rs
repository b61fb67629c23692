use thiserror::Error;

/// The error type used throughout this crate.
#[derive(Error, Debug)]
pub enum StfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end of file")]
    Eof,

    #[error("invalid record descriptor byte {0:#04x}")]
    InvalidDescriptor(u8),

    #[error("register {0:#x} not found")]
    RegNotFound(u16),

    #[error("not an STF file (bad identifier)")]
    NotAnStfFile,

    #[error("incomplete header: {0}")]
    IncompleteHeader(&'static str),

    #[error("header protocol violation: {0}")]
    HeaderOrderViolation(&'static str),

    #[error("trace version {0}.{1} is newer than this library supports")]
    UnsupportedVersion(u32, u32),

    #[error("writer ordering violation: {0}")]
    WriterOrderViolation(&'static str),

    #[error("MEM_CONTENT must follow MEM_ACCESS")]
    MissingMemContent,

    #[error("chunk index is corrupt: {0}")]
    CorruptChunkIndex(&'static str),

    #[error("seek past end of trace (marker {0} requested, {1} markers available)")]
    SeekOutOfRange(u64, u64),

    #[error("vlen must be set before packing/unpacking a vector operand")]
    VLenNotSet,

    #[error("InstIEM changed from {0:?} to {1:?}, which this ISA does not allow")]
    IemChangeNotAllowed(crate::enums::InstIem, crate::enums::InstIem),

    #[error("invalid value for STF_SINGLE_THREADED: {0:?} (expected one of 0, 1, true, false)")]
    InvalidEnvFlag(String),
}

pub type Result<T> = std::result::Result<T, StfError>;
