use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind};
use crate::engine::status::StatusCode;
use crate::key::Key;

use super::op_state;

#[derive(Default)]
pub(crate) struct DeleteState {
    problem: Option<Error>,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;

    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Delete);

    match code {
        StatusCode::DeleteProblem => {
            state.problem = Some(Error::new(match args.trim() {
                "1" => ErrorKind::NoPublicKey,
                // The secret key has to be deleted first
                "2" => ErrorKind::Conflict,
                "3" => ErrorKind::AmbiguousName,
                // Key is stored on a smartcard
                "4" => ErrorKind::NotImplemented,
                _ => ErrorKind::General,
            }, engine_source));
        },

        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },

        StatusCode::Eof => {
            if let Some(err) = state.problem.take() {
                return Err(err);
            }
            if let Some(err) = state.failure_code.take() {
                return Err(err);
            }
        },

        _ => {},
    }

    Ok(())
}

pub(crate) fn delete(ctx: &mut Context, key: &Key, allow_secret: bool) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    let fingerprint = key.fingerprint()
        .ok_or(Error::library(ErrorKind::InvalidValue))?
        .to_owned();

    ctx.push_hook(super::OpHook::Delete(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);

    engine.op_delete(&mut driver, &fingerprint, allow_secret)?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::engine::Protocol;
    use super::*;

    #[rstest(problem, expected,
        case("1", ErrorKind::NoPublicKey),
        case("2", ErrorKind::Conflict),
        case("3", ErrorKind::AmbiguousName),
        case("4", ErrorKind::NotImplemented),
    )]
    fn problems(problem: &str, expected: ErrorKind) {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Delete(Default::default()));

        status_handler(&mut ctx, StatusCode::DeleteProblem, problem).unwrap();
        let err = status_handler(&mut ctx, StatusCode::Eof, "").unwrap_err();
        assert_eq!(err.kind(), expected);
    }
}
