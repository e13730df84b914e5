use std::fmt;
use std::io;

macro_rules! Err {
    ($($arg:tt)*) => (::std::result::Result::Err(format!($($arg)*).into()))
}

pub type EmptyResult = OpResult<()>;
pub type OpResult<T> = Result<T, Error>;

/// The flat error code set surfaced to callers. Engine status lines carry
/// numeric gpg-error values which are mapped onto this set; everything the
/// mapping doesn't know collapses into `General`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid crypto engine")]
    InvalidEngine,
    #[error("no data")]
    NoData,
    #[error("bad passphrase")]
    BadPassphrase,
    #[error("operation canceled")]
    Canceled,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("wrong key usage")]
    WrongKeyUsage,
    #[error("no secret key")]
    NoSecretKey,
    #[error("no public key")]
    NoPublicKey,
    #[error("bad signature")]
    BadSignature,
    #[error("certificate revoked")]
    CertificateRevoked,
    #[error("no CRL known")]
    NoCrlKnown,
    #[error("CRL is too old")]
    CrlTooOld,
    #[error("not trusted")]
    NotTrusted,
    #[error("ambiguous name")]
    AmbiguousName,
    #[error("conflicting use")]
    Conflict,
    #[error("out of memory")]
    OutOfMemory,
    #[error("I/O error")]
    Io,
    #[error("pipe error")]
    PipeError,
    #[error("not implemented")]
    NotImplemented,
    #[error("general error")]
    General,
}

/// Which subsystem produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Library,
    Gpg,
    Gpgsm,
    Agent,
    User,
    System,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    source: ErrorSource,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, source: ErrorSource) -> Error {
        Error {kind, source, message: None}
    }

    pub fn with_message<M: Into<String>>(kind: ErrorKind, source: ErrorSource, message: M) -> Error {
        Error {kind, source, message: Some(message.into())}
    }

    pub fn general<M: Into<String>>(message: M) -> Error {
        Error::with_message(ErrorKind::General, ErrorSource::Library, message)
    }

    pub fn library(kind: ErrorKind) -> Error {
        Error::new(kind, ErrorSource::Library)
    }

    pub fn user(kind: ErrorKind) -> Error {
        Error::new(kind, ErrorSource::User)
    }

    /// Decodes a raw gpg-error value as sent by the engines on `ERROR` and
    /// `FAILURE` status lines: the error source lives in bits 24-30, the
    /// error code in the lower 16 bits.
    pub fn from_raw(value: u32) -> Error {
        let code = value & 0xffff;
        let source = match (value >> 24) & 0x7f {
            2 => ErrorSource::Gpg,
            3 => ErrorSource::Gpgsm,
            4..=6 => ErrorSource::Agent,
            7 => ErrorSource::Library,
            32..=35 => ErrorSource::User,
            _ => ErrorSource::Unknown,
        };

        let kind = match code {
            8 => ErrorKind::BadSignature,
            9 => ErrorKind::NoPublicKey,
            11 => ErrorKind::BadPassphrase,
            17 => ErrorKind::NoSecretKey,
            58 => ErrorKind::NoData,
            69 => ErrorKind::NotImplemented,
            70 => ErrorKind::Conflict,
            84 => ErrorKind::UnsupportedAlgorithm,
            94 => ErrorKind::CertificateRevoked,
            95 => ErrorKind::NoCrlKnown,
            96 => ErrorKind::CrlTooOld,
            99 | 198 => ErrorKind::Canceled,
            125 => ErrorKind::WrongKeyUsage,
            152 => ErrorKind::DecryptionFailed,
            code if code >= 1 << 15 => ErrorKind::Io,
            _ => ErrorKind::General,
        };

        Error::new(kind, source)
    }

    /// Parses a decimal gpg-error value from a status line field. Zero means
    /// no error and yields `None`.
    pub fn from_status_field(field: &str) -> Option<Error> {
        field.parse::<u32>().ok().filter(|&value| value != 0).map(Error::from_raw)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn source(&self) -> ErrorSource {
        self.source
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self.message {
            Some(ref message) => formatter.write_str(message),
            None => self.kind.fmt(formatter),
        }
    }
}

impl std::error::Error for Error {
}

impl From<String> for Error {
    fn from(message: String) -> Error {
        Error::general(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Error {
        Error::general(message)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        let kind = match err.kind() {
            io::ErrorKind::Unsupported => ErrorKind::NotImplemented,
            io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            io::ErrorKind::BrokenPipe => ErrorKind::PipeError,
            _ => ErrorKind::Io,
        };
        Error::with_message(kind, ErrorSource::System, err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Error {
        Error::with_message(ErrorKind::Io, ErrorSource::System, err.desc())
    }
}
