use crate::context::Context;
use crate::core::{EmptyResult, Error};
use crate::data::Data;
use crate::engine::status::StatusCode;

use super::op_state;

#[derive(Default)]
pub(crate) struct ExportState {
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;

    let state = op_state!(ctx, Export);

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

pub(crate) fn export(ctx: &mut Context, patterns: &[&str], keydata: &mut Data) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Export(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);

    engine.op_export(&mut driver, patterns, keydata, ctx.armor())?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
