#[macro_use] mod core;
mod context;
mod data;
mod engine;
mod key;
mod ops;
mod sys;
#[cfg(test)] mod tests;
mod util;

pub use crate::context::{
    CancelHandle, Context, Event, EventHandler, Interactor, KeylistMode, PassphraseProvider,
    ProgressHandler,
};
pub use crate::core::{EmptyResult, Error, ErrorKind, ErrorSource, OpResult};
pub use crate::data::{
    Callbacks, Data, DataSource, Encoding, ReadCallback, ReleaseCallback, SeekCallback,
    WriteCallback, DEFAULT_BUFFER_SIZE, get_blankout, set_blankout,
};
pub use crate::engine::{Engine, Protocol};
pub use crate::engine::status::StatusCode;
pub use crate::key::{
    CertSigStatus, Key, KeyRc, KeySignature, Subkey, TrustItem, TrustItemType, UserId, Validity,
};
pub use crate::ops::{InvalidKey, SignMode};
pub use crate::ops::decrypt::{DecryptResult, Recipient};
pub use crate::ops::encrypt::EncryptResult;
pub use crate::ops::genkey::GenkeyResult;
pub use crate::ops::import::{
    ImportResult, ImportStatus, IMPORT_NEW, IMPORT_SECRET, IMPORT_SIG, IMPORT_SUBKEY, IMPORT_UID,
};
pub use crate::ops::keylist::KeylistResult;
pub use crate::ops::passphrase::PassphrasePrompt;
pub use crate::ops::sign::{NewSignature, SignResult};
pub use crate::ops::verify::{Notation, SigStatus, SigSummary, Signature, VerifyResult};
pub use crate::sys::{Direction, FdEntry, Multiplexer};
pub use crate::util::dn::{Dn, DnAttribute};
