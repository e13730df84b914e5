use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, OpResult};
use crate::engine::status::StatusCode;

use super::op_state;

/// Accumulated passphrase prompt state, shared by all operations which may
/// have to unlock a secret key.
#[derive(Default)]
pub(crate) struct PassphraseState {
    userid_hint: Option<String>,
    passphrase_info: Option<String>,
    bad_passphrase: u32,
    no_passphrase: bool,
}

/// What the engine asks a passphrase for. The composite `prompt` follows the
/// classic `{TRY_AGAIN|ENTER}\n{userid-hint}\n{passphrase-info}` layout which
/// existing passphrase dialogs know how to render.
#[derive(Debug, Clone)]
pub struct PassphrasePrompt {
    pub prompt: String,
    pub userid_hint: Option<String>,
    pub passphrase_info: Option<String>,
    pub prior_attempt_failed: bool,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    if !ctx.has_passphrase_provider() {
        return Ok(());
    }

    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Passphrase);

    match code {
        StatusCode::UseridHint => {
            state.userid_hint = Some(args.to_owned());
        },
        StatusCode::BadPassphrase => {
            state.bad_passphrase += 1;
            state.no_passphrase = false;
        },
        StatusCode::GoodPassphrase => {
            state.bad_passphrase = 0;
            state.no_passphrase = false;
        },
        StatusCode::NeedPassphrase | StatusCode::NeedPassphraseSym => {
            state.passphrase_info = Some(args.to_owned());
        },
        StatusCode::MissingPassphrase => {
            state.no_passphrase = true;
        },
        StatusCode::Eof => {
            if state.no_passphrase || state.bad_passphrase > 0 {
                return Err(Error::new(ErrorKind::BadPassphrase, engine_source));
            }
        },
        _ => {},
    }

    Ok(())
}

/// The command channel handler shared by all interactive operations:
/// passphrase prompts go to the passphrase provider, everything else to the
/// interactor installed for the operation.
pub(crate) fn command_handler(ctx: &mut Context, code: StatusCode, keyword: &str) -> OpResult<String> {
    if code == StatusCode::GetHidden && keyword == "passphrase.enter" && ctx.has_passphrase_provider() {
        let request = {
            let state = op_state!(ctx, Passphrase);
            let prior_attempt_failed = state.bad_passphrase > 0;
            state.bad_passphrase = 0;

            let userid_hint = state.userid_hint.clone();
            let passphrase_info = state.passphrase_info.clone();

            PassphrasePrompt {
                prompt: format!("{}\n{}\n{}",
                    if prior_attempt_failed {"TRY_AGAIN"} else {"ENTER"},
                    userid_hint.as_deref().unwrap_or("[User ID hint missing]"),
                    passphrase_info.as_deref().unwrap_or("[passphrase info missing]")),
                userid_hint, passphrase_info, prior_attempt_failed,
            }
        };

        return ctx.provide_passphrase(&request);
    }

    ctx.interactor_reply(code, keyword)
}
