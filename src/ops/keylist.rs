use std::sync::Arc;

use crate::context::Context;
use crate::core::{EmptyResult, Error};
use crate::engine::status::StatusCode;
use crate::key::{CertSigStatus, Key, KeyRc, KeySignature, Subkey, UserId, Validity};
use crate::util;

use super::op_state;

#[derive(Debug, Clone, Default)]
pub struct KeylistResult {
    /// The engine could not list everything matching the patterns.
    pub truncated: bool,
}

#[derive(Default)]
pub(crate) struct KeylistState {
    pub result: KeylistResult,
    pub keys: Vec<KeyRc>,
    current: Option<Key>,
    // Certifying signatures are only taken right after their user ID record
    uid_active: bool,
    failure_code: Option<Error>,
}

impl KeylistState {
    fn finish_key(&mut self) -> Option<KeyRc> {
        let mut key = self.current.take()?;

        let mut can_encrypt = key.can_encrypt;
        let mut can_sign = key.can_sign;
        let mut can_certify = key.can_certify;
        for subkey in &key.subkeys {
            can_encrypt |= subkey.can_encrypt;
            can_sign |= subkey.can_sign;
            can_certify |= subkey.can_certify;
        }
        key.can_encrypt = can_encrypt;
        key.can_sign = can_sign;
        key.can_certify = can_certify;

        let key = Arc::new(key);
        self.keys.push(key.clone());
        Some(key)
    }
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;

    let state = op_state!(ctx, Keylist);

    match code {
        StatusCode::Truncated => state.result.truncated = true,
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

pub(crate) fn colon_handler(ctx: &mut Context, line: Option<&str>) -> EmptyResult {
    let state = op_state!(ctx, Keylist);

    let line = match line {
        Some(line) => line,
        None => {
            // End of listing
            if let Some(key) = state.finish_key() {
                ctx.emit_next_key(&key);
            }
            return Ok(());
        },
    };

    let fields: Vec<&str> = line.split(':').collect();
    let record = fields[0];

    // Signatures bind to the user ID record directly above them
    if record != "sig" && record != "rev" {
        state.uid_active = false;
    }

    let finished = match record {
        "pub" | "sec" | "crt" | "crs" => {
            let finished = state.finish_key();
            let secret = record == "sec" || record == "crs";
            let mut key = Key {
                secret,
                x509: record == "crt" || record == "crs",
                ..Default::default()
            };

            let mut primary = parse_subkey(&fields, secret);

            if let Some(&letters) = fields.get(1) {
                set_key_flags(&mut key, letters);
            }
            if let Some(&letters) = fields.get(8) {
                key.owner_trust = parse_validity(letters);
            }
            if let Some(&letters) = fields.get(11) {
                set_capabilities(&mut key, &mut primary, letters);
            }
            if key.x509 {
                if let Some(&serial) = fields.get(7).filter(|&&serial| !serial.is_empty()) {
                    key.issuer_serial = Some(serial.to_owned());
                }
                if let Some(&name) = fields.get(9).filter(|&&name| !name.is_empty()) {
                    key.issuer_name = Some(util::decode_c_string(name));
                }
            }

            key.subkeys.push(primary);
            state.current = Some(key);
            finished
        },

        "sub" | "ssb" => {
            if let Some(ref mut key) = state.current {
                let mut subkey = parse_subkey(&fields, record == "ssb");
                if let Some(&letters) = fields.get(11) {
                    set_subkey_capabilities(&mut subkey, letters);
                }
                key.subkeys.push(subkey);
            }
            None
        },

        "fpr" => {
            if let Some(ref mut key) = state.current {
                if let Some(&fingerprint) = fields.get(9).filter(|&&fpr| !fpr.is_empty()) {
                    let subkey = key.subkeys.last_mut();
                    if let Some(subkey) = subkey.filter(|subkey| subkey.fingerprint.is_none()) {
                        subkey.fingerprint = Some(fingerprint.to_owned());
                    }
                }
                if key.chain_id.is_none() {
                    if let Some(&chain_id) = fields.get(12).filter(|&&id| !id.is_empty()) {
                        key.chain_id = Some(chain_id.to_owned());
                    }
                }
            }
            None
        },

        "uid" => {
            if let Some(ref mut key) = state.current {
                if let Some(&uid) = fields.get(9) {
                    let mut user_id = UserId {
                        uid: util::decode_c_string(uid),
                        ..Default::default()
                    };
                    if let Some(&letters) = fields.get(1) {
                        set_userid_flags(&mut user_id, letters);
                    }
                    key.user_ids.push(user_id);
                    state.uid_active = true;
                }
            }
            None
        },

        "sig" | "rev" => {
            if state.uid_active {
                if let Some(ref mut key) = state.current {
                    let signature = parse_certsig(&fields, record == "rev");
                    if let Some(user_id) = key.user_ids.last_mut() {
                        user_id.signatures.push(signature);
                    }
                }
            }
            None
        },

        _ => None,
    };

    if let Some(key) = finished {
        ctx.emit_next_key(&key);
    }

    Ok(())
}

fn parse_subkey(fields: &[&str], secret: bool) -> Subkey {
    let mut subkey = Subkey {secret, ..Default::default()};

    if let Some(&letters) = fields.get(1) {
        set_subkey_flags(&mut subkey, letters);
    }
    if let Some(length) = fields.get(2).and_then(|field| field.parse().ok()) {
        if length > 1 {
            subkey.length = length;
        }
    }
    if let Some(algo) = fields.get(3).and_then(|field| field.parse().ok()) {
        if (1..128).contains(&algo) {
            subkey.algo = algo;
        }
    }
    if let Some(&keyid) = fields.get(4) {
        subkey.keyid = keyid.to_owned();
    }
    if let Some(&created) = fields.get(5) {
        subkey.created = util::parse_timestamp(created);
    }
    if let Some(&expires) = fields.get(6) {
        subkey.expires = util::parse_timestamp(expires);
    }

    subkey
}

// Flag letters precede the optional numeric part of the field
fn set_key_flags(key: &mut Key, letters: &str) {
    for letter in letters.chars().take_while(|letter| !letter.is_ascii_digit()) {
        match letter {
            'e' => key.expired = true,
            'r' => key.revoked = true,
            'd' => key.disabled = true,
            'i' => key.invalid = true,
            _ => {},
        }
    }
}

fn set_subkey_flags(subkey: &mut Subkey, letters: &str) {
    for letter in letters.chars().take_while(|letter| !letter.is_ascii_digit()) {
        match letter {
            'e' => subkey.expired = true,
            'r' => subkey.revoked = true,
            'd' => subkey.disabled = true,
            'i' => subkey.invalid = true,
            _ => {},
        }
    }
}

fn set_userid_flags(user_id: &mut UserId, letters: &str) {
    for letter in letters.chars().take_while(|letter| !letter.is_ascii_digit()) {
        match letter {
            'r' => user_id.revoked = true,
            'i' => user_id.invalid = true,
            letter => {
                let validity = parse_validity_letter(letter);
                if validity != Validity::Unknown {
                    user_id.validity = validity;
                }
            },
        }
    }
}

fn parse_validity(letters: &str) -> Validity {
    letters.chars().next().map(parse_validity_letter).unwrap_or_default()
}

fn parse_validity_letter(letter: char) -> Validity {
    match letter {
        'q' => Validity::Undefined,
        'n' => Validity::Never,
        'm' => Validity::Marginal,
        'f' => Validity::Full,
        'u' => Validity::Ultimate,
        _ => Validity::Unknown,
    }
}

// Lower case letters grant an ability to a subkey, upper case ones to the
// key as a whole. `d`/`D` mark the key as disabled.
fn set_capabilities(key: &mut Key, primary: &mut Subkey, letters: &str) {
    for letter in letters.chars() {
        match letter {
            'e' => primary.can_encrypt = true,
            's' => primary.can_sign = true,
            'c' => primary.can_certify = true,
            'E' => key.can_encrypt = true,
            'S' => key.can_sign = true,
            'C' => key.can_certify = true,
            'd' | 'D' => key.disabled = true,
            _ => {},
        }
    }
}

fn set_subkey_capabilities(subkey: &mut Subkey, letters: &str) {
    for letter in letters.chars() {
        match letter {
            'e' => subkey.can_encrypt = true,
            's' => subkey.can_sign = true,
            'c' => subkey.can_certify = true,
            _ => {},
        }
    }
}

fn parse_certsig(fields: &[&str], revocation: bool) -> KeySignature {
    let mut signature = KeySignature {revocation, ..Default::default()};

    if let Some(&status) = fields.get(1) {
        signature.status = match status.chars().next() {
            Some('!') => CertSigStatus::Good,
            Some('-') => CertSigStatus::Bad,
            Some('?') => CertSigStatus::NoKey,
            Some('%') => CertSigStatus::Error,
            _ => CertSigStatus::None,
        };
    }
    if let Some(algo) = fields.get(3).and_then(|field| field.parse().ok()) {
        if (1..128).contains(&algo) {
            signature.algo = algo;
        }
    }
    if let Some(&keyid) = fields.get(4) {
        signature.keyid = keyid.to_owned();
    }
    if let Some(&created) = fields.get(5) {
        signature.created = util::parse_timestamp(created);
    }
    if let Some(&expires) = fields.get(6) {
        signature.expires = util::parse_timestamp(expires);
    }
    if let Some(&uid) = fields.get(9) {
        signature.uid = util::decode_c_string(uid);
    }
    if let Some(&class) = fields.get(10) {
        let bytes = class.as_bytes();
        if bytes.len() >= 2 {
            if let Ok(value) = u8::from_str_radix(&class[..2], 16) {
                signature.class = value;
                if value == 0x30 {
                    signature.revocation = true;
                }
            }
            signature.exportable = bytes.get(2) == Some(&b'x');
        }
    }

    signature
}

pub(crate) fn keylist(ctx: &mut Context, patterns: &[&str], secret_only: bool) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();
    let with_sigs = ctx.keylist_includes_sigs();

    ctx.push_hook(super::OpHook::Keylist(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);
    driver.set_colon_handler(colon_handler)?;

    engine.op_keylist(&mut driver, patterns, secret_only, with_sigs)?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) fn take_keys(ctx: &mut Context) -> Vec<KeyRc> {
    for hook in ctx.op_hooks() {
        if let super::OpHook::Keylist(ref mut state) = *hook {
            return std::mem::take(&mut state.keys);
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use indoc::indoc;

    use crate::engine::Protocol;
    use super::*;

    fn list(listing: &str) -> (Context, Vec<KeyRc>, usize) {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.push_hook(super::super::OpHook::Keylist(Default::default()));

        let events = Rc::new(RefCell::new(0));
        {
            let events = events.clone();
            ctx.set_event_sink(Box::new(move |event: crate::context::Event| {
                if let crate::context::Event::NextKey(_) = event {
                    *events.borrow_mut() += 1;
                }
            }));
        }

        for line in listing.lines().filter(|line| !line.is_empty()) {
            colon_handler(&mut ctx, Some(line)).unwrap();
        }
        colon_handler(&mut ctx, None).unwrap();

        let keys = take_keys(&mut ctx);
        let count = *events.borrow();
        (ctx, keys, count)
    }

    #[test]
    fn listing() {
        let (_ctx, keys, events) = list(indoc!("
            tru::1:1695554253:0:3:1:5
            pub:u:1024:17:A0FF4590BB6122ED:920716800:::u:::scESC::::::
            fpr:::::::::A0FF4590BB6122EDEF6E3C542D727CC768697734:
            uid:u::::1695554236::CC265AE79E3E13E363CDAC0F688B6BD242B7CAF8::Alfa Test (demo key) <alfa@example.net>::::::::::0:
            uid:u::::1695554236::B9B49B7A6B087D5DD68344CDBA67C85A08CC28CB::Alpha Test (demo key) <alpha@example.net>::::::::::0:
            sub:u:1024:16:3B3FBC948FE59301:920716800::::::e::::::
            fpr:::::::::9277D8A8AA26D2DD2ABEB7C7E20DF3E28F6FFF9B:
        "));

        assert_eq!(events, 1);
        assert_eq!(keys.len(), 1);

        let key = &keys[0];
        assert!(!key.secret);
        assert_eq!(key.owner_trust, Validity::Ultimate);
        assert!(key.can_encrypt && key.can_sign && key.can_certify);

        let primary = key.primary().unwrap();
        assert_eq!(primary.keyid, "A0FF4590BB6122ED");
        assert_eq!(primary.keyid.len(), 16);
        assert_eq!(primary.algo, 17);
        assert_eq!(primary.length, 1024);
        assert_eq!(primary.fingerprint.as_deref(),
                   Some("A0FF4590BB6122EDEF6E3C542D727CC768697734"));
        assert!(primary.can_sign && primary.can_certify);
        assert!(!primary.can_encrypt);

        assert_eq!(key.user_ids.len(), 2);
        assert_eq!(key.user_ids[0].uid, "Alfa Test (demo key) <alfa@example.net>");
        assert_eq!(key.user_ids[0].validity, Validity::Ultimate);

        assert_eq!(key.subkeys.len(), 2);
        let subkey = &key.subkeys[1];
        assert_eq!(subkey.keyid, "3B3FBC948FE59301");
        assert!(subkey.can_encrypt);
        assert_eq!(subkey.fingerprint.as_deref(),
                   Some("9277D8A8AA26D2DD2ABEB7C7E20DF3E28F6FFF9B"));
    }

    #[test]
    fn escaped_user_id() {
        let (_ctx, keys, _) = list(indoc!(r"
            pub:-:2048:1:0123456789ABCDEF:1577836800:::-:::escESC::::::
            uid:-::::1577836800::0000000000000000000000000000000000000000::Strange \x3cdude\x3e <strange@example.net>::::::::::0:
        "));

        assert_eq!(keys[0].user_ids[0].uid, "Strange <dude> <strange@example.net>");
    }

    #[test]
    fn next_key_per_primary_record() {
        let (_ctx, keys, events) = list(indoc!("
            pub:-:2048:1:1111111111111111:1577836800:::-:::e::::::
            sec:-:2048:1:2222222222222222:1577836800:::-:::s::::::
            crt:-:2048:1:3333333333333333:1577836800:::-:::c::::::
            crs:-:2048:1:4444444444444444:1577836800:::-:::c::::::
        "));

        assert_eq!(events, 4);
        assert_eq!(keys.len(), 4);
        assert!(!keys[0].secret && !keys[0].x509);
        assert!(keys[1].secret && !keys[1].x509);
        assert!(!keys[2].secret && keys[2].x509);
        assert!(keys[3].secret && keys[3].x509);
    }

    #[test]
    fn certifying_signatures() {
        let (_ctx, keys, _) = list(indoc!("
            pub:f:1024:17:5C0DB3B0978D81BE:920716800:::-:::scESC::::::
            uid:f::::920716800::AA27B8F8A2B3DCF7B2E6E2B4C25256C7B9C8ACC0::Victor Test <victor@example.net>::::::::::0:
            sig:!::17:A0FF4590BB6122ED:920716800::::Alfa Test <alfa@example.net>:10x::8A0C1DB1BF3D3A66E6A0A42D727CC768697734AA:::8:
            rev:!::17:5C0DB3B0978D81BE:920716958::::Victor Test <victor@example.net>:30x::AA27B8F8A2B3DCF7B2E6E2B4C25256C7B9C8ACC0:::8:
            sub:f:1024:16:7857867DF8716A36:920716800::::::e::::::
            sig:!::17:5C0DB3B0978D81BE:920716800::::Victor Test <victor@example.net>:18x:::::8:
        "));

        let key = &keys[0];
        let signatures = &key.user_ids[0].signatures;
        assert_eq!(signatures.len(), 2);

        assert_eq!(signatures[0].status, CertSigStatus::Good);
        assert_eq!(signatures[0].keyid, "A0FF4590BB6122ED");
        assert_eq!(signatures[0].class, 0x10);
        assert!(signatures[0].exportable);
        assert!(!signatures[0].revocation);

        assert_eq!(signatures[1].class, 0x30);
        assert!(signatures[1].revocation);

        // The signature after the subkey record binds to no user ID
        assert_eq!(key.subkeys.len(), 2);
    }
}
