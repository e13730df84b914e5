use log::debug;

use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, ErrorSource, OpResult};
use crate::data::{self, Data};
use crate::engine::Protocol;
use crate::engine::status::StatusCode;
use crate::util;

use super::{op_state, verify};

/// A recipient the message has been encrypted to, from `ENC_TO` status
/// lines. The status is filled when the engine reports the matching secret
/// key as unavailable.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub keyid: String,
    pub pubkey_algo: u32,
    pub status: Option<Error>,
}

#[derive(Debug, Clone)]
pub struct DecryptResult {
    pub unsupported_algorithm: Option<String>,
    pub wrong_key_usage: bool,
    pub legacy_cipher_nomdc: bool,
    pub not_integrity_protected: bool,
    pub is_mime: bool,
    pub is_de_vs: bool,
    pub file_name: Option<String>,
    pub session_key: Option<String>,
    pub symkey_algo: String,
    pub recipients: Vec<Recipient>,
}

impl Default for DecryptResult {
    fn default() -> DecryptResult {
        DecryptResult {
            unsupported_algorithm: None,
            wrong_key_usage: false,
            legacy_cipher_nomdc: false,
            not_integrity_protected: false,
            is_mime: false,
            is_de_vs: false,
            file_name: None,
            session_key: None,
            symkey_algo: "?.?".to_owned(),
            recipients: Vec::new(),
        }
    }
}

pub(crate) struct DecryptState {
    pub result: DecryptResult,

    plaintext_serial: u64,
    ignore_mdc_error: bool,

    okay: bool,
    failed: bool,
    any_no_seckey: bool,

    failure_code: Option<Error>,
    first_status_error: Option<Error>,
    pkdecrypt_failed: Option<Error>,
    symdecrypt_failed: Option<Error>,
}

impl DecryptState {
    pub fn new(plaintext_serial: u64, ignore_mdc_error: bool) -> DecryptState {
        DecryptState {
            result: DecryptResult::default(),
            plaintext_serial, ignore_mdc_error,
            okay: false,
            failed: false,
            any_no_seckey: false,
            failure_code: None,
            first_status_error: None,
            pkdecrypt_failed: None,
            symdecrypt_failed: None,
        }
    }
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;
    core_handler(ctx, code, args)
}

pub(crate) fn decrypt_verify_status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;
    core_handler(ctx, code, args)?;
    verify::core_handler(ctx, code, args)
}

fn core_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    let engine_source = ctx.engine().error_source();
    let protocol = ctx.engine().protocol();
    let state = op_state!(ctx, Decrypt);

    match code {
        StatusCode::Failure => {
            let known = state.failure_code.as_ref()
                .is_some_and(|err| err.kind() != ErrorKind::General);
            if !known {
                if let Some(err) = super::parse_failure(args) {
                    state.failure_code = Some(err);
                }
            }
        },

        StatusCode::DecryptionInfo => parse_decryption_info(args, state, protocol)?,

        StatusCode::DecryptionOkay => state.okay = true,

        StatusCode::DecryptionFailed => {
            state.failed = true;
            // Poison the plaintext sink so unauthenticated output stays
            // unobservable. The object may be owned by another thread or
            // already be gone, hence the by-serial call with ignored result.
            if !state.ignore_mdc_error {
                data::set_blankout(state.plaintext_serial);
            }
        },

        // Informational, but used to return a better matching terminal error
        StatusCode::Error => parse_status_error(args, state)?,

        StatusCode::EncTo => {
            let recipient = parse_enc_to(args)?;
            state.result.recipients.push(recipient);
        },

        StatusCode::SessionKey => {
            state.result.session_key = Some(args.to_owned());
        },

        StatusCode::NoSeckey => {
            let recipient = state.result.recipients.iter_mut()
                .find(|recipient| recipient.keyid == args)
                .ok_or(Error::new(ErrorKind::InvalidEngine, engine_source))?;
            recipient.status = Some(Error::new(ErrorKind::NoSecretKey, engine_source));
            state.any_no_seckey = true;
        },

        StatusCode::Plaintext => {
            let fields = util::split_fields(args);
            if let Some(mode) = fields.first().and_then(|field| u8::from_str_radix(field, 16).ok()) {
                state.result.is_mime = mode == b'm';
            }
            if let Some(&name) = fields.get(2) {
                state.result.file_name = Some(util::decode_percent_string(name));
            }
        },

        StatusCode::DecryptionComplianceMode => {
            state.result.is_de_vs = util::split_fields(args).contains(&"23");
        },

        StatusCode::Eof => {
            if !state.okay && !state.ignore_mdc_error {
                data::set_blankout(state.plaintext_serial);
            }
            return terminal_error(state, engine_source);
        },

        _ => {},
    }

    Ok(())
}

// The terminal error ladder, most specific first
fn terminal_error(state: &mut DecryptState, engine_source: ErrorSource) -> EmptyResult {
    if state.failed {
        if let Some(ref err) = state.pkdecrypt_failed {
            return Err(err.clone());
        }
        if let Some(ref err) = state.symdecrypt_failed {
            return Err(err.clone());
        }

        // For an integrity failure return just decryption-failed; the cause
        // is visible in the result flags
        if state.result.not_integrity_protected && !state.ignore_mdc_error {
            return Err(Error::new(ErrorKind::DecryptionFailed, engine_source));
        }

        // Any other ERROR code is probably a better match than no-seckey: a
        // garbled message may report both
        if let Some(ref err) = state.first_status_error {
            return Err(err.clone());
        }

        if state.any_no_seckey {
            return Err(Error::new(ErrorKind::NoSecretKey, engine_source));
        }

        return Err(Error::new(ErrorKind::DecryptionFailed, engine_source));
    }

    if !state.okay {
        return Err(Error::new(ErrorKind::NoData, engine_source));
    }

    if let Some(err) = state.failure_code.take() {
        return Err(err);
    }

    Ok(())
}

fn parse_status_error(args: &str, state: &mut DecryptState) -> EmptyResult {
    let fields = util::split_fields(args);
    if fields.is_empty() {
        return Err(Error::library(ErrorKind::InvalidEngine));
    }

    let err = fields.get(1).and_then(|field| Error::from_status_field(field));
    let kind = err.as_ref().map(Error::kind);

    match fields[0] {
        "decrypt.algorithm" => {
            if kind == Some(ErrorKind::UnsupportedAlgorithm) {
                if let Some(&algo) = fields.get(2).filter(|&&algo| algo != "?") {
                    state.result.unsupported_algorithm = Some(algo.to_owned());
                }
            }
        },
        "decrypt.keyusage" => {
            if kind == Some(ErrorKind::WrongKeyUsage) {
                state.result.wrong_key_usage = true;
            }
        },
        "pkdecrypt_failed" => match kind {
            // These are severe enough to be reported instead of the general
            // decryption-failed code
            Some(ErrorKind::Canceled) | Some(ErrorKind::BadPassphrase) => {
                state.pkdecrypt_failed = err.clone();
            },
            _ => {},
        },
        "nomdc_with_legacy_cipher" => {
            state.result.legacy_cipher_nomdc = true;
            state.result.not_integrity_protected = true;
        },
        "symkey_decrypt.maybe_error" => {
            if kind == Some(ErrorKind::BadPassphrase) {
                state.symdecrypt_failed = err.clone();
            }
        },
        location => {
            debug!("{:?} error status: {:?}.", location, kind);
        },
    }

    if let Some(err) = err {
        state.first_status_error.get_or_insert(err);
    }

    Ok(())
}

// DECRYPTION_INFO <mdc-method> <sym-algo> [<aead-algo>]
fn parse_decryption_info(args: &str, state: &mut DecryptState, protocol: Protocol) -> EmptyResult {
    let fields = util::split_fields(args);
    if fields.len() < 2 {
        return Err(Error::library(ErrorKind::InvalidEngine));
    }

    let mdc: u32 = fields[0].parse().unwrap_or(0);
    let algo = cipher_algo_name(fields[1].parse().unwrap_or(0), protocol);
    let aead: u32 = fields.get(2).and_then(|field| field.parse().ok()).unwrap_or(0);

    state.result.symkey_algo = if aead == 0 && mdc != 2 {
        format!("{}.PGPCFB", algo)
    } else {
        format!("{}.{}", algo, cipher_mode_name(aead, protocol))
    };

    if mdc == 0 && aead == 0 {
        state.result.not_integrity_protected = true;
    }

    Ok(())
}

// ENC_TO <keyid> <pubkey-algo> <keylength>
fn parse_enc_to(args: &str) -> OpResult<Recipient> {
    let fields = util::split_fields(args);
    let keyid = *fields.first().ok_or(Error::library(ErrorKind::InvalidEngine))?;

    Ok(Recipient {
        keyid: keyid.to_owned(),
        pubkey_algo: fields.get(1).and_then(|field| field.parse().ok()).unwrap_or(0),
        status: None,
    })
}

fn cipher_algo_name(algo: u32, protocol: Protocol) -> &'static str {
    if protocol == Protocol::OpenPgp {
        match algo {
            1 => return "IDEA",
            2 => return "3DES",
            3 => return "CAST5",
            4 => return "BLOWFISH",
            7 => return "AES",
            8 => return "AES192",
            9 => return "AES256",
            10 => return "TWOFISH",
            11 => return "CAMELLIA128",
            12 => return "CAMELLIA192",
            13 => return "CAMELLIA256",
            _ => {},
        }
    }
    "Unknown"
}

fn cipher_mode_name(algo: u32, protocol: Protocol) -> &'static str {
    if protocol == Protocol::OpenPgp {
        match algo {
            0 => return "CFB",
            1 => return "EAX",
            2 => return "OCB",
            _ => {},
        }
    }
    "Unknown"
}

pub(crate) fn decrypt(ctx: &mut Context, cipher: &mut Data, plain: &mut Data,
                      with_verification: bool) -> EmptyResult {
    ctx.reset_op()?;
    let ignore_mdc_error = ctx.ignore_mdc_error();
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Passphrase(Default::default()));
    ctx.push_hook(super::OpHook::Decrypt(DecryptState::new(plain.serial(), ignore_mdc_error)));
    if with_verification {
        ctx.push_hook(super::OpHook::Verify(Default::default()));
    }

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(match with_verification {
        true => decrypt_verify_status_handler,
        false => status_handler,
    });
    if ctx.has_passphrase_provider() {
        driver.set_command_handler(super::passphrase::command_handler)?;
    }

    engine.op_decrypt(&mut driver, cipher, plain)?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
