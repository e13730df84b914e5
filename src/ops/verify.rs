use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::context::Context;
use crate::core::{EmptyResult, Error, ErrorKind};
use crate::data::Data;
use crate::engine::status::StatusCode;
use crate::key::Validity;
use crate::util;

use super::op_state;

/// Signature verdict derived from the `*SIG` status family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigStatus {
    #[default]
    None,
    Good,
    GoodExpired,
    GoodExpiredKey,
    Bad,
    NoKey,
    NoSig,
    Error,
}

bitflags! {
    /// Condensed signature verdict. `GREEN` and `RED` mirror the classic
    /// traffic light; `VALID` is only set for an unquestionable signature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SigSummary: u32 {
        const VALID = 1 << 0;
        const GREEN = 1 << 1;
        const RED = 1 << 2;
        const KEY_REVOKED = 1 << 3;
        const KEY_EXPIRED = 1 << 4;
        const SIG_EXPIRED = 1 << 5;
        const KEY_MISSING = 1 << 6;
        const CRL_MISSING = 1 << 7;
        const CRL_TOO_OLD = 1 << 8;
        const BAD_POLICY = 1 << 9;
        const SYS_ERROR = 1 << 10;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Notation {
    pub name: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub status: SigStatus,
    pub summary: SigSummary,

    /// Fingerprint for a good signature, key ID for a bad one.
    pub fingerprint: String,

    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub validity: Validity,
    pub wrong_key_usage: bool,

    pub notations: Vec<Notation>,
    pub policy_url: Option<String>,

    /// Raw trust error token from the `TRUST_*` status line, e.g.
    /// `Certificate_Revoked`.
    pub trust_error_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub signatures: Vec<Signature>,
}

#[derive(Default)]
pub(crate) struct VerifyState {
    pub result: VerifyResult,
    current: Option<Signature>,
    no_data: bool,
    failure_code: Option<Error>,
}

impl VerifyState {
    fn current(&mut self) -> crate::core::OpResult<&mut Signature> {
        self.current.as_mut().ok_or(Error::library(ErrorKind::InvalidEngine))
    }

    fn finish_signature(&mut self) {
        if let Some(mut signature) = self.current.take() {
            signature.summary = summarize(&signature);
            self.result.signatures.push(signature);
        }
    }
}

pub(crate) fn status_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    super::progress_status(ctx, code, args)?;
    core_handler(ctx, code, args)
}

pub(crate) fn core_handler(ctx: &mut Context, code: StatusCode, args: &str) -> EmptyResult {
    let engine_source = ctx.engine().error_source();
    let state = op_state!(ctx, Verify);

    match code {
        StatusCode::GoodSig | StatusCode::ExpSig | StatusCode::ExpKeySig
        | StatusCode::BadSig | StatusCode::ErrSig => {
            // A new signature starts
            state.finish_signature();
            state.current = Some(Signature::default());
        },
        _ => {},
    }

    match code {
        StatusCode::NoData | StatusCode::Unexpected => {
            state.no_data = true;
        },

        StatusCode::GoodSig => state.current()?.status = SigStatus::Good,
        StatusCode::ExpSig => state.current()?.status = SigStatus::GoodExpired,
        StatusCode::ExpKeySig => state.current()?.status = SigStatus::GoodExpiredKey,

        StatusCode::BadSig => {
            let signature = state.current()?;
            signature.status = SigStatus::Bad;
            // Only the key ID is known for a bad signature
            signature.fingerprint = first_token(args).to_owned();
        },

        StatusCode::ErrSig => {
            let fields = util::split_fields(args);
            let signature = state.current()?;
            // The 6th field is the reason; 9 means the key is missing
            signature.status = match fields.get(5) {
                Some(&"9") => SigStatus::NoKey,
                _ => SigStatus::Error,
            };
            signature.fingerprint = fields.first().copied().unwrap_or_default().to_owned();
        },

        StatusCode::ValidSig => {
            let fields = util::split_fields(args);
            let signature = state.current()?;

            if signature.status == SigStatus::None {
                signature.status = SigStatus::Good;
            }
            if let Some(&fingerprint) = fields.first() {
                signature.fingerprint = fingerprint.to_owned();
            }
            // Field 2 is the formatted date; 3 and 4 the raw timestamps
            if let Some(&created) = fields.get(2) {
                signature.created = util::parse_timestamp(created);
            }
            if let Some(&expires) = fields.get(3) {
                signature.expires = util::parse_timestamp(expires);
            }
        },

        StatusCode::NotationName => {
            state.current()?.notations.push(Notation {
                name: Some(util::decode_percent_string(args)),
                value: String::new(),
            });
        },

        StatusCode::NotationData => {
            let signature = state.current()?;
            let data = util::decode_percent_string(args);
            match signature.notations.last_mut() {
                Some(notation) => notation.value.push_str(&data),
                None => signature.notations.push(Notation {name: None, value: data}),
            }
        },

        StatusCode::PolicyUrl => {
            state.current()?.policy_url = Some(util::decode_percent_string(args));
        },

        StatusCode::TrustUndefined => {
            let signature = state.current()?;
            signature.validity = Validity::Unknown;
            signature.trust_error_token = trust_token(args);
        },
        StatusCode::TrustNever => {
            let signature = state.current()?;
            signature.validity = Validity::Never;
            signature.trust_error_token = trust_token(args);
        },
        StatusCode::TrustMarginal => {
            let signature = state.current()?;
            if signature.status == SigStatus::Good {
                signature.validity = Validity::Marginal;
            }
            signature.trust_error_token = trust_token(args);
        },
        StatusCode::TrustFully | StatusCode::TrustUltimate => {
            let signature = state.current()?;
            if signature.status == SigStatus::Good {
                signature.validity = Validity::Full;
            }
        },

        StatusCode::Error => {
            let fields = util::split_fields(args);
            let kind = fields.get(1)
                .and_then(|field| Error::from_status_field(field))
                .map(|err| err.kind());

            match fields.first() {
                Some(&"verify.findkey") => {
                    let signature = state.current()?;
                    signature.status = match kind {
                        Some(ErrorKind::NoPublicKey) => SigStatus::NoKey,
                        _ => SigStatus::Error,
                    };
                },
                _ => {
                    if kind == Some(ErrorKind::WrongKeyUsage) {
                        state.current()?.wrong_key_usage = true;
                    }
                },
            }
        },

        StatusCode::Failure => {
            if state.failure_code.is_none() {
                state.failure_code = super::parse_failure(args);
            }
        },

        StatusCode::Eof => {
            state.finish_signature();

            if state.result.signatures.is_empty() {
                if state.no_data {
                    return Err(Error::new(ErrorKind::NoData, engine_source));
                }
                if let Some(err) = state.failure_code.take() {
                    return Err(err);
                }
            }
        },

        _ => {},
    }

    Ok(())
}

fn first_token(args: &str) -> &str {
    args.split(' ').next().unwrap_or("")
}

fn trust_token(args: &str) -> Option<String> {
    let token = first_token(args);
    (!token.is_empty()).then(|| token.to_owned())
}

fn summarize(signature: &Signature) -> SigSummary {
    let mut summary = SigSummary::empty();
    let good = matches!(signature.status,
        SigStatus::Good | SigStatus::GoodExpired | SigStatus::GoodExpiredKey);

    match signature.validity {
        Validity::Full | Validity::Ultimate if good => summary |= SigSummary::GREEN,
        Validity::Never if good => summary |= SigSummary::RED,
        _ => {},
    }
    if signature.status == SigStatus::Bad {
        summary |= SigSummary::RED;
    }

    match signature.status {
        SigStatus::GoodExpired => summary |= SigSummary::SIG_EXPIRED,
        SigStatus::GoodExpiredKey => summary |= SigSummary::KEY_EXPIRED,
        SigStatus::NoKey => summary |= SigSummary::KEY_MISSING,
        SigStatus::Error => summary |= SigSummary::SYS_ERROR,
        _ => {},
    }

    match signature.trust_error_token.as_deref() {
        Some("Certificate_Revoked") => summary |= SigSummary::KEY_REVOKED,
        Some("No_CRL_Known") => summary |= SigSummary::CRL_MISSING,
        Some("CRL_Too_Old") => summary |= SigSummary::CRL_TOO_OLD,
        Some("No_Policy_Match") => summary |= SigSummary::BAD_POLICY,
        Some(_) => summary |= SigSummary::SYS_ERROR,
        None => {},
    }

    if signature.wrong_key_usage {
        summary |= SigSummary::BAD_POLICY;
    }

    if summary == SigSummary::GREEN {
        summary |= SigSummary::VALID;
    }

    summary
}

pub(crate) fn verify(ctx: &mut Context, sig: &mut Data, signed_text: Option<&mut Data>,
                     plaintext: Option<&mut Data>) -> EmptyResult {
    ctx.reset_op()?;
    let engine = ctx.engine().clone();

    ctx.push_hook(super::OpHook::Verify(Default::default()));

    let mut driver = ctx.new_driver()?;
    driver.set_status_handler(status_handler);

    engine.op_verify(&mut driver, sig, signed_text, plaintext)?;
    driver.spawn()?;

    match driver.run(ctx) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
