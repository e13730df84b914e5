use chrono::{DateTime, Utc};

use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, OpResult};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::util;

use super::{op_state, InvalidKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignMode {
    #[default]
    Normal,
    Detached,
    Clear,
}

/// One signature the engine created, from a `SIG_CREATED` status line.
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub mode: SignMode,
    pub pubkey_algo: u32,
    pub hash_algo: u32,
    pub class: u32,
    pub created: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignResult {
    pub signatures: Vec<NewSignature>,
    pub invalid_signers: Vec<InvalidKey>,
}

#[derive(Default)]
pub(crate) struct SignState {
    pub result: SignResult,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;
    core_handler(ctx, code, args)
}

pub(crate) fn core_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Sign);

    match code {
        StatusCode::SigCreated => {
            state.result.signatures.push(parse_sig_created(args)?);
        },

        StatusCode::InvSgnr => {
            state.result.invalid_signers.push(super::parse_invalid_key(args, true)?);
        },

        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },

        StatusCode::Eof => {
            if state.result.signatures.is_empty() {
                if let Some(signer) = state.result.invalid_signers.first() {
                    return Err(signer.reason.clone().unwrap_or(
                        Error::new(ErrorKind::NoSecretKey, engine_source)));
                }
                if let Some(err) = state.failure_code.take() {
                    return Err(err);
                }
                return Err(Error::new(ErrorKind::NoData, engine_source));
            }

            if let Some(err) = state.failure_code.take() {
                return Err(err);
            }
        },

        _ => {},
    }

    Ok(())
}

// SIG_CREATED <type> <pubkey-algo> <hash-algo> <class> <timestamp> <fpr>
fn parse_sig_created(args: &str) -> OpResult<NewSignature> {
    let fields = util::split_fields(args);
    if fields.len() < 6 {
        return Err(Error::library(ErrorKind::InvalidEngine));
    }

    Ok(NewSignature {
        mode: match fields[0] {
            "D" => SignMode::Detached,
            "C" => SignMode::Clear,
            _ => SignMode::Normal,
        },
        pubkey_algo: fields[1].parse().unwrap_or(0),
        hash_algo: fields[2].parse().unwrap_or(0),
        class: u32::from_str_radix(fields[3], 16).unwrap_or(0),
        created: util::parse_timestamp(fields[4]),
        fingerprint: fields[5].to_owned(),
    })
}

pub(crate) fn sign(ctx: &mut Context, plain: &mut Data, sig: &mut Data,
                   mode: SignMode) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Passphrase(Default::default()));
    ctx.push_hook(super::OpHook::Sign(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);
    if ctx.has_passphrase_provider() {
        driver.set_command_handler(super::passphrase::command_handler)?;
    }

    engine.op_sign(&mut driver, plain, sig, mode, ctx.armor(), ctx.textmode(),
                   ctx.signers(), ctx.include_certs())?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::engine::Protocol;
    use crate::key::{Key, Subkey};
    use super::*;

    #[test]
    fn created_signatures() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Passphrase(Default::default()));
        ctx.push_hook(super::super::OpHook::Sign(Default::default()));

        for (code, args) in [
            (StatusCode::SigCreated, "D 1 8 01 1577836800 A0FF4590BB6122EDEF6E3C542D727CC768697734"),
            (StatusCode::SigCreated, "D 17 8 01 1577836800 23FD347A419429BACCD5E72D6BC4778054ACD246"),
            (StatusCode::Eof, ""),
        ] {
            status_handler(&mut ctx, code, args).unwrap();
        }

        let result = ctx.sign_result().unwrap();
        assert_eq!(result.signatures.len(), 2);

        let signature = &result.signatures[0];
        assert_eq!(signature.mode, SignMode::Detached);
        assert_eq!(signature.pubkey_algo, 1);
        assert_eq!(signature.hash_algo, 8);
        assert_eq!(signature.class, 1);
        assert_eq!(signature.fingerprint, "A0FF4590BB6122EDEF6E3C542D727CC768697734");
    }

    #[test]
    fn invalid_signer() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Passphrase(Default::default()));
        ctx.push_hook(super::super::OpHook::Sign(Default::default()));

        status_handler(&mut ctx, StatusCode::InvSgnr, "9 23FD347A419429BACCD5E72D6BC4778054ACD246").unwrap();
        let err = status_handler(&mut ctx, StatusCode::Eof, "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSecretKey);

        let result = ctx.sign_result().unwrap();
        assert_eq!(result.invalid_signers.len(), 1);
        assert_eq!(result.invalid_signers[0].key, "23FD347A419429BACCD5E72D6BC4778054ACD246");
    }

    #[test]
    fn signer_args_preserve_order() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        for keyid in ["2D727CC768697734", "56D33B536C65E0F3"] {
            ctx.add_signer(Arc::new(Key {
                subkeys: vec![Subkey {keyid: keyid.to_owned(), ..Default::default()}],
                ..Default::default()
            }));
        }

        let engine = ctx.engine().clone();
        let mut plain = Data::from_bytes(b"payload");
        let mut sig = Data::new();

        let mut driver = ctx.new_driver().unwrap();
        driver.set_status_handler(status_handler);
        engine.op_sign(&mut driver, &mut plain, &mut sig, SignMode::Detached,
                       true, false, ctx.signers(), None).unwrap();

        let args = driver.test_render_args().unwrap();
        let tail: Vec<&str> = args.iter().map(String::as_str)
            .skip_while(|&arg| arg != "--sign").collect();
        assert_eq!(tail, vec![
            "--sign", "--detach", "--armor",
            "-u", "2D727CC768697734",
            "-u", "56D33B536C65E0F3",
        ]);
    }
}
