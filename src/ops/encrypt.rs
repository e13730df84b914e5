use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::key::{KeyRc, Validity};

use super::{op_state, InvalidKey};

#[derive(Debug, Clone, Default)]
pub struct EncryptResult {
    pub invalid_recipients: Vec<InvalidKey>,
    /// No usable recipient remained after the engine checked them all.
    pub no_recipients: bool,
}

#[derive(Default)]
pub(crate) struct EncryptState {
    pub result: EncryptResult,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;
    core_handler(ctx, code, args)
}

fn encrypt_sign_status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;
    core_handler(ctx, code, args)?;
    super::sign::core_handler(ctx, code, args)
}

fn core_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Encrypt);

    match code {
        StatusCode::InvRecp => {
            state.result.invalid_recipients.push(super::parse_invalid_key(args, false)?);
        },

        StatusCode::NoRecp => {
            state.result.no_recipients = true;
        },

        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },

        StatusCode::Eof => {
            if state.result.no_recipients {
                let reason = state.result.invalid_recipients.first()
                    .and_then(|recipient| recipient.reason.clone());
                return Err(reason.unwrap_or(
                    Error::new(ErrorKind::NoPublicKey, engine_source)));
            }
            if let Some(err) = state.failure_code.take() {
                return Err(err);
            }
        },

        _ => {},
    }

    Ok(())
}

fn all_recipients_trusted(recipients: &[KeyRc]) -> bool {
    !recipients.is_empty() && recipients.iter().all(|key| {
        matches!(key.owner_trust, Validity::Full | Validity::Ultimate)
    })
}

pub(crate) fn encrypt(ctx: &mut Context, recipients: &[KeyRc], plain: &mut Data,
                      cipher: &mut Data, sign_too: bool) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Passphrase(Default::default()));
    ctx.push_hook(super::OpHook::Encrypt(Default::default()));
    if sign_too {
        ctx.push_hook(super::OpHook::Sign(Default::default()));
    }

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(match sign_too {
        true => encrypt_sign_status_handler,
        false => status_handler,
    });
    if ctx.has_passphrase_provider() {
        driver.set_command_handler(super::passphrase::command_handler)?;
    }

    // Recipients of full or ultimate validity don't need another trust check
    let always_trust = all_recipients_trusted(recipients);

    if sign_too {
        engine.op_encrypt_sign(&mut driver, recipients, ctx.signers(), plain, cipher,
                               ctx.armor(), always_trust)?;
    } else {
        engine.op_encrypt(&mut driver, recipients, plain, cipher,
                          ctx.armor(), always_trust)?;
    }
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Protocol;
    use super::*;

    #[test]
    fn unusable_recipient() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Passphrase(Default::default()));
        ctx.push_hook(super::super::OpHook::Encrypt(Default::default()));

        status_handler(&mut ctx, StatusCode::InvRecp, "1 nosuchname@example.net").unwrap();
        status_handler(&mut ctx, StatusCode::NoRecp, "0").unwrap();

        let err = status_handler(&mut ctx, StatusCode::Eof, "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPublicKey);

        let result = ctx.encrypt_result().unwrap();
        assert!(result.no_recipients);
        assert_eq!(result.invalid_recipients.len(), 1);
        assert_eq!(result.invalid_recipients[0].key, "nosuchname@example.net");
        assert_eq!(result.invalid_recipients[0].reason.as_ref().unwrap().kind(),
                   ErrorKind::NoPublicKey);
    }
}
