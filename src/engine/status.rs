use std::os::fd::AsFd;
use std::str;

use crate::sys;

/// Typed engine status events. `Eof` is synthetic: it is dispatched by the
/// driver when the status pipe closes and never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    BadSig,
    BadPassphrase,
    BeginDecryption,
    BeginEncryption,
    BeginSigning,
    DecryptionComplianceMode,
    DecryptionFailed,
    DecryptionInfo,
    DecryptionOkay,
    DeleteProblem,
    EncTo,
    EndDecryption,
    EndEncryption,
    EndStream,
    Error,
    ErrSig,
    ExpKeySig,
    ExpSig,
    Failure,
    GetBool,
    GetHidden,
    GetLine,
    GoodSig,
    GoodPassphrase,
    ImportOk,
    ImportProblem,
    ImportRes,
    InquireMaxlen,
    InvRecp,
    InvSgnr,
    KeyExpired,
    KeyConsidered,
    KeyCreated,
    MissingPassphrase,
    NeedPassphrase,
    NeedPassphraseSym,
    NoData,
    NotationData,
    NotationName,
    NoPubkey,
    NoRecp,
    NoSeckey,
    PinentryLaunched,
    Plaintext,
    PolicyUrl,
    Progress,
    SessionKey,
    SigExpired,
    SigCreated,
    Truncated,
    TrustFully,
    TrustMarginal,
    TrustNever,
    TrustUltimate,
    TrustUndefined,
    Unexpected,
    UseridHint,
    ValidSig,
    Eof,
}

// Sorted by keyword for binary search
static STATUS_TABLE: &[(&str, StatusCode)] = &[
    ("BADSIG", StatusCode::BadSig),
    ("BAD_PASSPHRASE", StatusCode::BadPassphrase),
    ("BEGIN_DECRYPTION", StatusCode::BeginDecryption),
    ("BEGIN_ENCRYPTION", StatusCode::BeginEncryption),
    ("BEGIN_SIGNING", StatusCode::BeginSigning),
    ("DECRYPTION_COMPLIANCE_MODE", StatusCode::DecryptionComplianceMode),
    ("DECRYPTION_FAILED", StatusCode::DecryptionFailed),
    ("DECRYPTION_INFO", StatusCode::DecryptionInfo),
    ("DECRYPTION_OKAY", StatusCode::DecryptionOkay),
    ("DELETE_PROBLEM", StatusCode::DeleteProblem),
    ("ENC_TO", StatusCode::EncTo),
    ("END_DECRYPTION", StatusCode::EndDecryption),
    ("END_ENCRYPTION", StatusCode::EndEncryption),
    ("END_STREAM", StatusCode::EndStream),
    ("ERROR", StatusCode::Error),
    ("ERRSIG", StatusCode::ErrSig),
    ("EXPKEYSIG", StatusCode::ExpKeySig),
    ("EXPSIG", StatusCode::ExpSig),
    ("FAILURE", StatusCode::Failure),
    ("GET_BOOL", StatusCode::GetBool),
    ("GET_HIDDEN", StatusCode::GetHidden),
    ("GET_LINE", StatusCode::GetLine),
    ("GOODSIG", StatusCode::GoodSig),
    ("GOOD_PASSPHRASE", StatusCode::GoodPassphrase),
    ("IMPORT_OK", StatusCode::ImportOk),
    ("IMPORT_PROBLEM", StatusCode::ImportProblem),
    ("IMPORT_RES", StatusCode::ImportRes),
    ("INQUIRE_MAXLEN", StatusCode::InquireMaxlen),
    ("INV_RECP", StatusCode::InvRecp),
    ("INV_SGNR", StatusCode::InvSgnr),
    ("KEYEXPIRED", StatusCode::KeyExpired),
    ("KEY_CONSIDERED", StatusCode::KeyConsidered),
    ("KEY_CREATED", StatusCode::KeyCreated),
    ("MISSING_PASSPHRASE", StatusCode::MissingPassphrase),
    ("NEED_PASSPHRASE", StatusCode::NeedPassphrase),
    ("NEED_PASSPHRASE_SYM", StatusCode::NeedPassphraseSym),
    ("NODATA", StatusCode::NoData),
    ("NOTATION_DATA", StatusCode::NotationData),
    ("NOTATION_NAME", StatusCode::NotationName),
    ("NO_PUBKEY", StatusCode::NoPubkey),
    ("NO_RECP", StatusCode::NoRecp),
    ("NO_SECKEY", StatusCode::NoSeckey),
    ("PINENTRY_LAUNCHED", StatusCode::PinentryLaunched),
    ("PLAINTEXT", StatusCode::Plaintext),
    ("POLICY_URL", StatusCode::PolicyUrl),
    ("PROGRESS", StatusCode::Progress),
    ("SESSION_KEY", StatusCode::SessionKey),
    ("SIGEXPIRED", StatusCode::SigExpired),
    ("SIG_CREATED", StatusCode::SigCreated),
    ("TRUNCATED", StatusCode::Truncated),
    ("TRUST_FULLY", StatusCode::TrustFully),
    ("TRUST_MARGINAL", StatusCode::TrustMarginal),
    ("TRUST_NEVER", StatusCode::TrustNever),
    ("TRUST_ULTIMATE", StatusCode::TrustUltimate),
    ("TRUST_UNDEFINED", StatusCode::TrustUndefined),
    ("UNEXPECTED", StatusCode::Unexpected),
    ("USERID_HINT", StatusCode::UseridHint),
    ("VALIDSIG", StatusCode::ValidSig),
];

const STATUS_PREFIX: &[u8] = b"[GNUPG:] ";

pub fn lookup(keyword: &str) -> Option<StatusCode> {
    STATUS_TABLE.binary_search_by_key(&keyword, |&(name, _)| name).ok()
        .map(|index| STATUS_TABLE[index].1)
}

/// Parses one complete status line (without the terminating LF). Returns
/// `None` for anything which is not a well-formed status line with a known
/// keyword: the engines print diagnostics on the same channel and those are
/// skipped, not treated as errors.
pub fn parse_line(line: &[u8]) -> Option<(StatusCode, &str)> {
    let rest = line.strip_prefix(STATUS_PREFIX)?;
    if !rest.first().is_some_and(u8::is_ascii_uppercase) {
        return None;
    }

    let rest = str::from_utf8(rest).ok()?;
    let (keyword, args) = match rest.split_once(' ') {
        Some((keyword, args)) => (keyword, args),
        None => (rest, ""),
    };

    lookup(keyword).map(|code| (code, args))
}

/// Assembles LF-terminated lines from a non-blocking pipe. The buffer starts
/// at 1 KiB and is extended by another 1 KiB whenever less than 256 bytes of
/// room remain, so a single line may get arbitrarily long (large user IDs
/// easily exceed 8 KiB).
pub struct LineBuffer {
    buf: Vec<u8>,
    len: usize,
}

const LINE_BUFFER_SIZE: usize = 1024;
const LINE_BUFFER_GROW: usize = 1024;
const LINE_BUFFER_MIN_ROOM: usize = 256;

impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer {
            buf: vec![0; LINE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Reads once from the fd. Returns the number of bytes read with zero
    /// meaning EOF.
    pub fn fill<F: AsFd>(&mut self, fd: F) -> nix::Result<usize> {
        if self.buf.len() - self.len < LINE_BUFFER_MIN_ROOM {
            self.buf.resize(self.buf.len() + LINE_BUFFER_GROW, 0);
        }

        let size = sys::read_retry(fd, &mut self.buf[self.len..])?;
        self.len += size;
        Ok(size)
    }

    /// Passes each complete line (LF stripped) to the handler and shifts any
    /// partial tail to the buffer start.
    pub fn drain_lines<H>(&mut self, mut handler: H) -> crate::core::EmptyResult
        where H: FnMut(&[u8]) -> crate::core::EmptyResult
    {
        let mut start = 0;

        while let Some(pos) = self.buf[start..self.len].iter().position(|&byte| byte == b'\n') {
            let end = start + pos;
            handler(&self.buf[start..end])?;
            start = end + 1;
        }

        self.buf.copy_within(start..self.len, 0);
        self.len -= start;
        Ok(())
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.buf.len()
    }
}
