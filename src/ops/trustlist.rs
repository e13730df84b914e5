use crate::context::Context;
use crate::core::{EmptyResult, Error};
use crate::engine::status::StatusCode;
use crate::key::{TrustItem, TrustItemType};

use super::op_state;

#[derive(Default)]
pub(crate) struct TrustlistState {
    pub items: Vec<TrustItem>,
    failure_code: Option<Error>,
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;

    let state = op_state!(ctx, Trustlist);

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

// Trust path records: level:keyid:type:recno:ot:val:mc:cc:name:
// TYPE is K for a key and U for a user ID; OT is only present on K lines,
// NAME only on U lines.
pub(crate) fn colon_handler(ctx: &mut Context, line: Option<&str>) -> EmptyResult {
    let line = match line {
        Some(line) => line,
        None => return Ok(()),
    };

    let item = {
        let state = op_state!(ctx, Trustlist);
        let fields: Vec<&str> = line.split(':').collect();

        let mut item = TrustItem {
            level: fields.first().and_then(|field| field.parse().ok()).unwrap_or(0),
            ..Default::default()
        };

        if let Some(&keyid) = fields.get(1) {
            item.keyid = keyid.to_owned();
        }
        item.item_type = match fields.get(2) {
            Some(&"K") => TrustItemType::Key,
            Some(&"U") => TrustItemType::UserId,
            _ => TrustItemType::Unknown,
        };
        item.owner_trust = fields.get(4).and_then(|field| field.chars().next());
        item.validity = fields.get(5).and_then(|field| field.chars().next());
        item.name = fields.get(8)
            .filter(|&&name| !name.is_empty())
            .map(|&name| name.to_owned());

        state.items.push(item.clone());
        item
    };

    ctx.emit_next_trust_item(&item);
    Ok(())
}

pub(crate) fn trustlist(ctx: &mut Context, pattern: &str) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Trustlist(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);
    driver.set_colon_handler(colon_handler)?;

    engine.op_trustlist(&mut driver, pattern)?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) fn take_items(ctx: &mut Context) -> Vec<TrustItem> {
    for hook in ctx.op_hooks() {
        if let super::OpHook::Trustlist(ref mut state) = *hook {
            return std::mem::take(&mut state.items);
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use crate::engine::Protocol;
    use super::*;

    #[test]
    fn trust_path() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Trustlist(Default::default()));

        for line in [
            "2:A0FF4590BB6122ED:K:132:f:::",
            "2:A0FF4590BB6122ED:U:168::f:3:5:Alfa Test <alfa@example.net>:",
        ] {
            colon_handler(&mut ctx, Some(line)).unwrap();
        }
        colon_handler(&mut ctx, None).unwrap();

        let items = take_items(&mut ctx);
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].level, 2);
        assert_eq!(items[0].item_type, TrustItemType::Key);
        assert_eq!(items[0].owner_trust, Some('f'));
        assert!(items[0].name.is_none());

        assert_eq!(items[1].item_type, TrustItemType::UserId);
        assert_eq!(items[1].validity, Some('f'));
        assert_eq!(items[1].name.as_deref(), Some("Alfa Test <alfa@example.net>"));
    }
}
