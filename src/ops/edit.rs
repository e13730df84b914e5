use crate::context::{Context, Interactor};
use crate::core::{EmptyResult, Error, ErrorKind};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::key::Key;

use super::op_state;

#[derive(Default)]
pub(crate) struct EditState {
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    super::passphrase::status_handler(ctx, code, args)?;

    // The interactor sees the full status stream so it can follow the
    // engine through the edit dialogue
    ctx.interactor_status(code, args);

    let state = op_state!(ctx, Edit);

    match code {
        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },
        StatusCode::Eof => {
            if let Some(err) = state.failure_code.take() {
                return Err(err);
            }
        },
        _ => {},
    }

    Ok(())
}

/// Runs an interactive `--edit-key` session. Prompts are answered by the
/// interactor; whatever the engine prints during the session is collected
/// into `out`.
pub(crate) fn edit(ctx: &mut Context, key: &Key, interactor: Box<dyn Interactor>,
                   out: &mut Data) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    let fingerprint = key.fingerprint()
        .ok_or(Error::library(ErrorKind::InvalidValue))?
        .to_owned();

    ctx.push_hook(super::OpHook::Passphrase(Default::default()));
    ctx.push_hook(super::OpHook::Edit(Default::default()));
    ctx.set_interactor(Some(interactor));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);
    driver.set_command_handler(super::passphrase::command_handler)?;

    let signers: Vec<_> = ctx.signers().to_vec();
    engine.op_edit(&mut driver, &fingerprint, out, &signers)?;

    let mut result = driver.spawn();
    if result.is_ok() {
        result = match driver.run(ctx) {
            Some(err) => Err(err),
            None => Ok(()),
        };
    }

    drop(driver);
    ctx.set_interactor(None);
    result
}
