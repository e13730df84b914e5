use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::util;

use super::op_state;

#[derive(Debug, Clone, Default)]
pub struct GenkeyResult {
    pub fingerprint: Option<String>,
    pub primary_created: bool,
    pub sub_created: bool,
}

#[derive(Default)]
pub(crate) struct GenkeyState {
    pub result: GenkeyResult,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;

    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Genkey);

    match code {
        // KEY_CREATED <type> <fpr>: P for primary, B for both, S for subkey
        StatusCode::KeyCreated => {
            let fields = util::split_fields(args);
            match fields.first() {
                Some(&"P") => state.result.primary_created = true,
                Some(&"S") => state.result.sub_created = true,
                Some(&"B") => {
                    state.result.primary_created = true;
                    state.result.sub_created = true;
                },
                _ => {},
            }
            if let Some(&fingerprint) = fields.get(1) {
                state.result.fingerprint = Some(fingerprint.to_owned());
            }
        },

        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },

        StatusCode::Eof => {
            if let Some(err) = state.failure_code.take() {
                return Err(err);
            }
            if !state.result.primary_created && !state.result.sub_created {
                return Err(Error::new(ErrorKind::General, engine_source));
            }
        },

        _ => {},
    }

    Ok(())
}

/// Generates a key from an engine-specific parameter block (the classic
/// `Key-Type: ...` batch format for gpg).
pub(crate) fn genkey(ctx: &mut Context, params: &mut Data) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Passphrase(Default::default()));
    ctx.push_hook(super::OpHook::Genkey(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);
    if ctx.has_passphrase_provider() {
        driver.set_command_handler(super::passphrase::command_handler)?;
    }

    engine.op_genkey(&mut driver, params, ctx.armor())?;
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
    fn created_key() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Passphrase(Default::default()));
        ctx.push_hook(super::super::OpHook::Genkey(Default::default()));

        status_handler(&mut ctx, StatusCode::KeyCreated,
                       "B 23FD347A419429BACCD5E72D6BC4778054ACD246").unwrap();
        status_handler(&mut ctx, StatusCode::Eof, "").unwrap();

        let result = ctx.genkey_result().unwrap();
        assert!(result.primary_created && result.sub_created);
        assert_eq!(result.fingerprint.as_deref(),
                   Some("23FD347A419429BACCD5E72D6BC4778054ACD246"));
    }

    #[test]
    fn nothing_created() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Passphrase(Default::default()));
        ctx.push_hook(super::super::OpHook::Genkey(Default::default()));

        let err = status_handler(&mut ctx, StatusCode::Eof, "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::General);
    }
}
