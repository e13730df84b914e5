use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind, OpResult};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::util;

use super::op_state;

// IMPORT_OK status bit values
pub const IMPORT_NEW: u32 = 1;
pub const IMPORT_UID: u32 = 2;
pub const IMPORT_SIG: u32 = 4;
pub const IMPORT_SUBKEY: u32 = 8;
pub const IMPORT_SECRET: u32 = 16;

/// Per-key import outcome. `result` is `None` for a successful import, in
/// which case `status` tells what the import changed.
#[derive(Debug, Clone, Default)]
pub struct ImportStatus {
    pub fingerprint: String,
    pub result: Option<Error>,
    pub status: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub considered: u64,
    pub no_user_id: u64,
    pub imported: u64,
    pub imported_rsa: u64,
    pub new_user_ids: u64,
    pub new_sub_keys: u64,
    pub new_signatures: u64,
    pub new_revocations: u64,
    pub secret_read: u64,
    pub secret_imported: u64,
    pub secret_unchanged: u64,
    pub not_imported: u64,

    pub imports: Vec<ImportStatus>,
}

#[derive(Default)]
pub(crate) struct ImportState {
    pub result: ImportResult,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;

    let state = op_state!(ctx, Import);

    match code {
        StatusCode::ImportOk => {
            state.result.imports.push(parse_import(args, false)?);
        },

        StatusCode::ImportProblem => {
            state.result.imports.push(parse_import(args, true)?);
        },

        StatusCode::ImportRes => {
            parse_import_res(args, &mut state.result)?;
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
        },

        _ => {},
    }

    Ok(())
}

// IMPORT_OK <status> <fpr> / IMPORT_PROBLEM <reason> <fpr>
fn parse_import(args: &str, problem: bool) -> OpResult<ImportStatus> {
    let fields = util::split_fields(args);
    let value: u32 = fields.first()
        .and_then(|field| field.parse().ok())
        .ok_or(Error::library(ErrorKind::InvalidEngine))?;

    let mut import = ImportStatus {
        fingerprint: fields.get(1).map(|&fpr| fpr.to_owned()).unwrap_or_default(),
        ..Default::default()
    };

    if problem {
        import.result = Some(Error::library(match value {
            1 => ErrorKind::InvalidValue,
            2 => ErrorKind::General,  // issuer certificate missing
            3 => ErrorKind::General,  // certificate chain too long
            _ => ErrorKind::General,
        }));
    } else {
        import.status = value;
    }

    Ok(import)
}

// IMPORT_RES carries 12 counters in a fixed order
fn parse_import_res(args: &str, result: &mut ImportResult) -> EmptyResult {
    let fields = util::split_fields(args);
    let counters = [
        &mut result.considered,
        &mut result.no_user_id,
        &mut result.imported,
        &mut result.imported_rsa,
        &mut result.new_user_ids,
        &mut result.new_sub_keys,
        &mut result.new_signatures,
        &mut result.new_revocations,
        &mut result.secret_read,
        &mut result.secret_imported,
        &mut result.secret_unchanged,
        &mut result.not_imported,
    ];

    for (counter, field) in counters.into_iter().zip(&fields) {
        *counter = field.parse().map_err(|_| Error::library(ErrorKind::InvalidEngine))?;
    }

    Ok(())
}

pub(crate) fn import(ctx: &mut Context, keydata: &mut Data) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Import(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);

    engine.op_import(&mut driver, keydata)?;
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
    fn import_statuses() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Import(Default::default()));

        for (code, args) in [
            (StatusCode::ImportOk, "1 A0FF4590BB6122EDEF6E3C542D727CC768697734"),
            (StatusCode::ImportOk, "0 23FD347A419429BACCD5E72D6BC4778054ACD246"),
            (StatusCode::ImportProblem, "1 0000000000000000000000000000000000000000"),
            (StatusCode::ImportRes, "3 0 1 0 0 0 0 0 0 0 0 1"),
            (StatusCode::Eof, ""),
        ] {
            status_handler(&mut ctx, code, args).unwrap();
        }

        let result = ctx.import_result().unwrap();
        assert_eq!(result.considered, 3);
        assert_eq!(result.imported, 1);
        assert_eq!(result.not_imported, 1);

        assert_eq!(result.imports.len(), 3);
        assert_eq!(result.imports[0].status, IMPORT_NEW);
        assert!(result.imports[0].result.is_none());
        assert_eq!(result.imports[1].status, 0);
        assert!(result.imports[2].result.is_some());
    }
}
