use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::debug;

use crate::core::{EmptyResult, Error, ErrorKind, OpResult};
use crate::data::Data;
use crate::engine::{Engine, Locale, Protocol};
use crate::engine::driver::Driver;
use crate::engine::status::StatusCode;
use crate::key::{Key, KeyRc, TrustItem};
use crate::ops::{self, OpHook, SignMode};
use crate::ops::decrypt::DecryptResult;
use crate::ops::encrypt::EncryptResult;
use crate::ops::genkey::GenkeyResult;
use crate::ops::import::ImportResult;
use crate::ops::keylist::KeylistResult;
use crate::ops::passphrase::PassphrasePrompt;
use crate::ops::sign::SignResult;
use crate::ops::verify::VerifyResult;
use crate::sys::{Multiplexer, PollMultiplexer};

/// Supplies passphrases for secret key operations. Returning a `Canceled`
/// error aborts the operation.
pub trait PassphraseProvider {
    fn provide(&mut self, request: &PassphrasePrompt) -> OpResult<String>;
}

impl<F> PassphraseProvider for F
    where F: FnMut(&PassphrasePrompt) -> OpResult<String>
{
    fn provide(&mut self, request: &PassphrasePrompt) -> OpResult<String> {
        self(request)
    }
}

/// Answers engine inquiries during interactive operations (key editing).
/// `status` additionally receives the full status stream, which interactive
/// scripts usually need to know where in the dialogue the engine is.
pub trait Interactor {
    fn reply(&mut self, code: StatusCode, keyword: &str) -> OpResult<String>;

    fn status(&mut self, _code: StatusCode, _args: &str) {
    }
}

/// Events fired by the engine driver while an operation runs.
pub enum Event<'a> {
    Start,
    Done(Option<&'a Error>),
    NextKey(&'a KeyRc),
    NextTrustItem(&'a TrustItem),
}

pub type EventHandler = Box<dyn FnMut(Event)>;
pub type ProgressHandler = Box<dyn FnMut(&str, char, u64, u64)>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeylistMode: u32 {
        const LOCAL = 1 << 0;
        /// Include certifying signatures in listings.
        const SIGS = 1 << 1;
    }
}

impl Default for KeylistMode {
    fn default() -> KeylistMode {
        KeylistMode::LOCAL
    }
}

/// Cancels a running operation from another thread. The flag is observed at
/// every driver loop iteration; on observation all engine fds are closed
/// which signals the child to die, and the operation reports a canceled
/// error.
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// A crypto operation context: engine binding, operation settings, caller
/// callbacks and the results of the last operation. One context runs one
/// operation at a time; contexts are independent of each other.
pub struct Context {
    engine: Engine,
    armor: bool,
    textmode: bool,
    keylist_mode: KeylistMode,
    include_certs: Option<u32>,
    signers: Vec<KeyRc>,
    locale: Locale,
    ignore_mdc_error: bool,

    passphrase_provider: Option<Box<dyn PassphraseProvider>>,
    interactor: Option<Box<dyn Interactor>>,
    progress_handler: Option<ProgressHandler>,
    event_sink: Option<EventHandler>,
    multiplexer: Option<Box<dyn Multiplexer>>,

    busy: bool,
    cancel_flag: Arc<AtomicBool>,

    op_data: Vec<OpHook>,
}

impl Context {
    pub fn new(protocol: Protocol) -> Context {
        Context {
            engine: Engine::new(protocol, None),
            armor: false,
            textmode: false,
            keylist_mode: KeylistMode::default(),
            include_certs: None,
            signers: Vec::new(),
            locale: Locale::default(),
            ignore_mdc_error: false,

            passphrase_provider: None,
            interactor: None,
            progress_handler: None,
            event_sink: None,
            multiplexer: None,

            busy: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),

            op_data: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.engine.protocol()
    }

    /// Overrides the engine binary. By default the engine is looked up in
    /// `PATH` under its usual name.
    pub fn set_engine_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.engine.set_path(path.into());
    }

    pub fn armor(&self) -> bool {
        self.armor
    }

    pub fn set_armor(&mut self, armor: bool) {
        self.armor = armor;
    }

    pub fn textmode(&self) -> bool {
        self.textmode
    }

    pub fn set_textmode(&mut self, textmode: bool) {
        self.textmode = textmode;
    }

    pub fn set_keylist_mode(&mut self, mode: KeylistMode) {
        self.keylist_mode = mode;
    }

    /// How many certificates to send along with an S/MIME signature.
    pub fn set_include_certs(&mut self, count: Option<u32>) {
        self.include_certs = count;
    }

    pub fn set_locale(&mut self, ctype: Option<String>, messages: Option<String>) {
        self.locale = Locale {ctype, messages};
    }

    /// Makes the next decrypt operation release plaintext even when the
    /// message carries no integrity protection. Resets automatically.
    pub fn set_ignore_mdc_error(&mut self, ignore: bool) {
        self.ignore_mdc_error = ignore;
    }

    pub fn signers(&self) -> &[KeyRc] {
        &self.signers
    }

    pub fn add_signer(&mut self, key: KeyRc) {
        self.signers.push(key);
    }

    pub fn clear_signers(&mut self) {
        self.signers.clear();
    }

    pub fn set_passphrase_provider<P: PassphraseProvider + 'static>(&mut self, provider: P) {
        self.passphrase_provider = Some(Box::new(provider));
    }

    pub fn clear_passphrase_provider(&mut self) {
        self.passphrase_provider = None;
    }

    pub fn set_progress_handler(&mut self, handler: ProgressHandler) {
        self.progress_handler = Some(handler);
    }

    pub fn set_event_sink(&mut self, sink: EventHandler) {
        self.event_sink = Some(sink);
    }

    /// Installs a custom readiness multiplexer, integrating the driver loop
    /// with an external event mechanism.
    pub fn set_multiplexer(&mut self, multiplexer: Box<dyn Multiplexer>) {
        self.multiplexer = Some(multiplexer);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {flag: self.cancel_flag.clone()}
    }

    /// Cancelling an idle context is a no-op; a running operation observes
    /// the flag at its next loop iteration.
    pub fn cancel(&mut self) {
        if self.busy {
            self.cancel_flag.store(true, Ordering::Relaxed);
        }
    }

    // Operations

    pub fn decrypt(&mut self, cipher: &mut Data, plain: &mut Data) -> EmptyResult {
        let result = ops::decrypt::decrypt(self, cipher, plain, false);
        self.ignore_mdc_error = false;
        result
    }

    pub fn decrypt_verify(&mut self, cipher: &mut Data, plain: &mut Data) -> EmptyResult {
        let result = ops::decrypt::decrypt(self, cipher, plain, true);
        self.ignore_mdc_error = false;
        result
    }

    /// Verifies a signature. For a detached signature pass the signed
    /// material in `signed_text`; for normal and cleartext signatures pass a
    /// `plaintext` sink which receives the verified payload. The operation
    /// succeeds whenever verification ran; the verdict is in the result.
    pub fn verify(&mut self, sig: &mut Data, signed_text: Option<&mut Data>,
                  plaintext: Option<&mut Data>) -> EmptyResult {
        ops::verify::verify(self, sig, signed_text, plaintext)
    }

    pub fn sign(&mut self, plain: &mut Data, sig: &mut Data, mode: SignMode) -> EmptyResult {
        ops::sign::sign(self, plain, sig, mode)
    }

    pub fn encrypt(&mut self, recipients: &[KeyRc], plain: &mut Data,
                   cipher: &mut Data) -> EmptyResult {
        if recipients.is_empty() {
            return Err(Error::library(ErrorKind::InvalidValue));
        }
        ops::encrypt::encrypt(self, recipients, plain, cipher, false)
    }

    /// Symmetric encryption with a passphrase.
    pub fn encrypt_symmetric(&mut self, plain: &mut Data, cipher: &mut Data) -> EmptyResult {
        ops::encrypt::encrypt(self, &[], plain, cipher, false)
    }

    pub fn encrypt_sign(&mut self, recipients: &[KeyRc], plain: &mut Data,
                        cipher: &mut Data) -> EmptyResult {
        if recipients.is_empty() {
            return Err(Error::library(ErrorKind::InvalidValue));
        }
        ops::encrypt::encrypt(self, recipients, plain, cipher, true)
    }

    pub fn keylist(&mut self, pattern: Option<&str>, secret_only: bool) -> OpResult<Vec<KeyRc>> {
        let patterns: Vec<&str> = pattern.into_iter().collect();
        ops::keylist::keylist(self, &patterns, secret_only)?;
        Ok(ops::keylist::take_keys(self))
    }

    pub fn keylist_ext(&mut self, patterns: &[&str], secret_only: bool) -> OpResult<Vec<KeyRc>> {
        ops::keylist::keylist(self, patterns, secret_only)?;
        Ok(ops::keylist::take_keys(self))
    }

    pub fn import(&mut self, keydata: &mut Data) -> EmptyResult {
        ops::import::import(self, keydata)
    }

    pub fn export(&mut self, patterns: &[&str], keydata: &mut Data) -> EmptyResult {
        ops::export::export(self, patterns, keydata)
    }

    pub fn genkey(&mut self, params: &mut Data) -> EmptyResult {
        ops::genkey::genkey(self, params)
    }

    pub fn delete(&mut self, key: &Key, allow_secret: bool) -> EmptyResult {
        ops::delete::delete(self, key, allow_secret)
    }

    pub fn trustlist(&mut self, pattern: &str) -> OpResult<Vec<TrustItem>> {
        ops::trustlist::trustlist(self, pattern)?;
        Ok(ops::trustlist::take_items(self))
    }

    pub fn edit(&mut self, key: &Key, interactor: Box<dyn Interactor>,
                out: &mut Data) -> EmptyResult {
        ops::edit::edit(self, key, interactor, out)
    }

    // Operation results, readable until the next operation starts

    pub fn decrypt_result(&self) -> Option<&DecryptResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Decrypt(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn verify_result(&self) -> Option<&VerifyResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Verify(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn sign_result(&self) -> Option<&SignResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Sign(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn encrypt_result(&self) -> Option<&EncryptResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Encrypt(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn keylist_result(&self) -> Option<&KeylistResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Keylist(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn import_result(&self) -> Option<&ImportResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Import(ref state) => Some(&state.result),
            _ => None,
        })
    }

    pub fn genkey_result(&self) -> Option<&GenkeyResult> {
        self.op_data.iter().find_map(|hook| match *hook {
            OpHook::Genkey(ref state) => Some(&state.result),
            _ => None,
        })
    }

    // Internal plumbing for the operation modules and the engine driver

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn new_driver<'d>(&self) -> OpResult<Driver<'d>> {
        self.engine.new_driver(&self.locale)
    }

    pub(crate) fn reset_op(&mut self) -> EmptyResult {
        if self.busy {
            return Err(Error::with_message(ErrorKind::Conflict, crate::core::ErrorSource::Library,
                "An operation is already running on this context"));
        }

        self.op_data.clear();
        self.cancel_flag.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn ignore_mdc_error(&self) -> bool {
        self.ignore_mdc_error
    }

    pub(crate) fn op_hooks(&mut self) -> &mut Vec<OpHook> {
        &mut self.op_data
    }

    pub(crate) fn push_hook(&mut self, hook: OpHook) {
        self.op_data.push(hook);
    }

    pub(crate) fn keylist_includes_sigs(&self) -> bool {
        self.keylist_mode.contains(KeylistMode::SIGS)
    }

    pub(crate) fn include_certs(&self) -> Option<u32> {
        self.include_certs
    }

    pub(crate) fn has_passphrase_provider(&self) -> bool {
        self.passphrase_provider.is_some()
    }

    pub(crate) fn provide_passphrase(&mut self, request: &PassphrasePrompt) -> OpResult<String> {
        match self.passphrase_provider {
            Some(ref mut provider) => provider.provide(request),
            None => Err(Error::user(ErrorKind::BadPassphrase)),
        }
    }

    pub(crate) fn set_interactor(&mut self, interactor: Option<Box<dyn Interactor>>) {
        self.interactor = interactor;
    }

    pub(crate) fn interactor_reply(&mut self, code: StatusCode, keyword: &str) -> OpResult<String> {
        match self.interactor {
            Some(ref mut interactor) => interactor.reply(code, keyword),
            None => Err(Error::general(format!(
                "The engine requested {:?} for {:?}, but no handler is installed", code, keyword))),
        }
    }

    pub(crate) fn interactor_status(&mut self, code: StatusCode, args: &str) {
        if let Some(ref mut interactor) = self.interactor {
            interactor.status(code, args);
        }
    }

    pub(crate) fn report_progress(&mut self, what: &str, type_: char, current: u64, total: u64) {
        if let Some(ref mut handler) = self.progress_handler {
            handler(what, type_, current, total);
        }
    }

    pub(crate) fn emit_start(&mut self) {
        self.busy = true;
        if let Some(ref mut sink) = self.event_sink {
            sink(Event::Start);
        }
    }

    pub(crate) fn emit_done(&mut self, error: Option<&Error>) {
        self.busy = false;
        if let Some(ref mut sink) = self.event_sink {
            sink(Event::Done(error));
        }
    }

    pub(crate) fn emit_next_key(&mut self, key: &KeyRc) {
        if let Some(ref mut sink) = self.event_sink {
            sink(Event::NextKey(key));
        }
    }

    pub(crate) fn emit_next_trust_item(&mut self, item: &TrustItem) {
        if let Some(ref mut sink) = self.event_sink {
            sink(Event::NextTrustItem(item));
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    pub(crate) fn take_multiplexer(&mut self) -> Box<dyn Multiplexer> {
        self.multiplexer.take().unwrap_or_else(|| Box::new(PollMultiplexer))
    }

    pub(crate) fn restore_multiplexer(&mut self, multiplexer: Box<dyn Multiplexer>) {
        self.multiplexer = Some(multiplexer);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.busy {
            debug!("Dropping a busy context.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_when_idle_is_noop() {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.cancel();
        assert!(!ctx.cancel_requested());

        // A fresh operation resets any stale cancellation
        ctx.cancel_handle().cancel();
        ctx.reset_op().unwrap();
        assert!(!ctx.cancel_requested());
    }
}
