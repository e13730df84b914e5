pub mod decrypt;
pub mod delete;
pub mod edit;
pub mod encrypt;
pub mod export;
pub mod genkey;
pub mod import;
pub mod keylist;
pub mod passphrase;
pub mod sign;
pub mod trustlist;
pub mod verify;

use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, OpResult};
use crate::engine::status::StatusCode;
use crate::util;

pub use self::sign::SignMode;

/// Per-operation result accumulators. One chain lives on the context; it is
/// cleared when the next operation starts, so results stay readable until
/// then. Status handlers are the only writers during an operation.
pub(crate) enum OpHook {
    Passphrase(passphrase::PassphraseState),
    Decrypt(decrypt::DecryptState),
    Verify(verify::VerifyState),
    Sign(sign::SignState),
    Encrypt(encrypt::EncryptState),
    Keylist(keylist::KeylistState),
    Import(import::ImportState),
    Genkey(genkey::GenkeyState),
    Delete(delete::DeleteState),
    Trustlist(trustlist::TrustlistState),
    Export(export::ExportState),
    Edit(edit::EditState),
}

// Looks up the hook of the running operation. A missing hook means a status
// handler fired for an operation which never registered - the engine behaves
// unexpectedly.
macro_rules! op_state {
    ($ctx:expr, $variant:ident) => {{
        let mut found = None;
        for hook in $ctx.op_hooks() {
            if let crate::ops::OpHook::$variant(ref mut state) = *hook {
                found = Some(state);
                break;
            }
        }
        match found {
            Some(state) => state,
            None => return Err(crate::core::Error::library(
                crate::core::ErrorKind::InvalidEngine)),
        }
    }};
}

pub(crate) use op_state;

/// Dispatches `PROGRESS what type current total` lines to the context's
/// progress handler.
pub(crate) fn progress_status(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    if code != StatusCode::Progress {
        return Ok(());
    }

    let fields = util::split_fields(args);
    if fields.len() < 4 {
        return Ok(());
    }

    let what = fields[0];
    let type_ = fields[1].chars().next().unwrap_or('?');
    let current = fields[2].parse().unwrap_or(0);
    let total = fields[3].parse().unwrap_or(0);

    ctx.report_progress(what, type_, current, total);
    Ok(())
}

/// Parses `FAILURE <location> <code>` args into the engine's error.
pub(crate) fn parse_failure(args: &str) -> Option<Error> {
    let fields = util::split_fields(args);
    Error::from_status_field(fields.get(1)?)
}

/// A key which could not be used as a recipient or signer, from `INV_RECP`
/// and `INV_SGNR` status lines.
#[derive(Debug, Clone)]
pub struct InvalidKey {
    pub key: String,
    pub reason: Option<Error>,
}

pub(crate) fn parse_invalid_key(args: &str, signer: bool) -> OpResult<InvalidKey> {
    let fields = util::split_fields(args);
    if fields.is_empty() {
        return Err(Error::library(ErrorKind::InvalidEngine));
    }

    let reason = match fields[0].parse::<u32>().unwrap_or(0) {
        0 => None,
        1 if signer => Some(ErrorKind::NoSecretKey),
        1 => Some(ErrorKind::NoPublicKey),
        2 => Some(ErrorKind::AmbiguousName),
        3 => Some(ErrorKind::WrongKeyUsage),
        4 => Some(ErrorKind::CertificateRevoked),
        6 => Some(ErrorKind::NoCrlKnown),
        7 => Some(ErrorKind::CrlTooOld),
        9 => Some(ErrorKind::NoSecretKey),
        10 => Some(ErrorKind::NotTrusted),
        _ => Some(ErrorKind::General),
    }.map(Error::library);

    Ok(InvalidKey {
        key: fields.get(1).map(|&fpr| fpr.to_owned()).unwrap_or_default(),
        reason,
    })
}
