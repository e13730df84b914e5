use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::OpResult;
use crate::util::dn::Dn;

/// Keys are handed out as shared handles: the context's signer list and the
/// caller may hold them concurrently from different threads.
pub type KeyRc = Arc<Key>;

/// Computed validity as reported in colon listings and trust status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
}

#[derive(Debug, Clone, Default)]
pub struct Key {
    pub secret: bool,
    pub x509: bool,

    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,

    // Usability of the whole key: some usable subkey grants these
    pub can_encrypt: bool,
    pub can_sign: bool,
    pub can_certify: bool,

    pub owner_trust: Validity,

    // X.509 only
    pub issuer_serial: Option<String>,
    pub issuer_name: Option<String>,
    pub chain_id: Option<String>,

    /// The primary key is the first entry.
    pub subkeys: Vec<Subkey>,
    pub user_ids: Vec<UserId>,
}

impl Key {
    pub fn primary(&self) -> Option<&Subkey> {
        self.subkeys.first()
    }

    pub fn keyid(&self) -> Option<&str> {
        self.primary().map(|subkey| subkey.keyid.as_str())
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.primary().and_then(|subkey| subkey.fingerprint.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Subkey {
    pub secret: bool,
    pub keyid: String,
    pub fingerprint: Option<String>,
    pub algo: u32,
    pub length: u32,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,

    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,

    pub can_encrypt: bool,
    pub can_sign: bool,
    pub can_certify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserId {
    pub uid: String,
    pub validity: Validity,
    pub revoked: bool,
    pub invalid: bool,

    /// Certifying signatures and revocations, present when the listing was
    /// requested with signatures.
    pub signatures: Vec<KeySignature>,
}

impl UserId {
    /// Parses the user ID as an RFC 2253 distinguished name. Meaningful for
    /// X.509 certificates where the engine reports subject DNs as user IDs.
    pub fn dn(&self) -> OpResult<Dn> {
        Dn::parse(&self.uid)
    }
}

/// Status of a certifying signature in a `sig`/`rev` colon record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertSigStatus {
    #[default]
    None,
    Good,
    Bad,
    NoKey,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct KeySignature {
    pub keyid: String,
    pub uid: String,
    pub algo: u32,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub status: CertSigStatus,
    pub class: u8,
    pub revocation: bool,
    pub exportable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustItemType {
    #[default]
    Unknown,
    Key,
    UserId,
}

/// One record of a trust path listing.
#[derive(Debug, Clone, Default)]
pub struct TrustItem {
    pub level: i32,
    pub keyid: String,
    pub item_type: TrustItemType,
    pub owner_trust: Option<char>,
    pub validity: Option<char>,
    pub name: Option<String>,
}
