pub mod driver;
pub mod status;

use std::path::{Path, PathBuf};

use crate::core::{EmptyResult, Error, ErrorKind, ErrorSource, OpResult};
use crate::data::Data;
use crate::key::KeyRc;
use crate::ops::SignMode;

use self::driver::{Driver, DriverConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenPgp,
    Cms,
}

/// The crypto engine bound to a context. One variant per protocol: both are
/// driven through the same status-fd child protocol, but differ in binary,
/// supported operations and option spelling.
#[derive(Debug, Clone)]
pub enum Engine {
    Gpg {path: PathBuf},
    Gpgsm {path: PathBuf},
}

impl Engine {
    pub fn new(protocol: Protocol, path: Option<PathBuf>) -> Engine {
        match protocol {
            Protocol::OpenPgp => Engine::Gpg {path: path.unwrap_or_else(|| PathBuf::from("gpg"))},
            Protocol::Cms => Engine::Gpgsm {path: path.unwrap_or_else(|| PathBuf::from("gpgsm"))},
        }
    }

    pub fn protocol(&self) -> Protocol {
        match *self {
            Engine::Gpg {..} => Protocol::OpenPgp,
            Engine::Gpgsm {..} => Protocol::Cms,
        }
    }

    pub fn path(&self) -> &Path {
        match *self {
            Engine::Gpg {ref path} | Engine::Gpgsm {ref path} => path,
        }
    }

    pub fn set_path(&mut self, new: PathBuf) {
        match *self {
            Engine::Gpg {ref mut path} | Engine::Gpgsm {ref mut path} => *path = new,
        }
    }

    pub(crate) fn error_source(&self) -> ErrorSource {
        match *self {
            Engine::Gpg {..} => ErrorSource::Gpg,
            Engine::Gpgsm {..} => ErrorSource::Gpgsm,
        }
    }

    pub(crate) fn new_driver<'d>(&self, locale: &Locale) -> OpResult<Driver<'d>> {
        match *self {
            Engine::Gpg {ref path} => {
                let mut driver = Driver::new("gpg", path, DriverConfig {
                    batch_arg: true,
                    comment_arg: true,
                    special_filenames: true,
                })?;

                driver.add_arg("--no-tty");
                driver.add_arg("--charset");
                driver.add_arg("utf8");

                if let Some(ref lc_ctype) = locale.ctype {
                    driver.add_arg("--lc-ctype");
                    driver.add_arg(lc_ctype.as_str());
                }
                if let Some(ref lc_messages) = locale.messages {
                    driver.add_arg("--lc-messages");
                    driver.add_arg(lc_messages.as_str());
                }

                Ok(driver)
            },
            Engine::Gpgsm {ref path} => {
                Driver::new("gpgsm", path, DriverConfig {
                    batch_arg: true,
                    comment_arg: false,
                    special_filenames: false,
                })
            },
        }
    }

    pub(crate) fn op_decrypt<'a>(&self, driver: &mut Driver<'a>,
                                 cipher: &'a mut Data, plain: &'a mut Data) -> EmptyResult {
        driver.add_arg("--decrypt");
        driver.add_arg("--output");
        driver.add_arg("-");
        driver.add_data(plain, Some(1), true);
        driver.add_data(cipher, Some(0), false);
        Ok(())
    }

    pub(crate) fn op_verify<'a>(&self, driver: &mut Driver<'a>, sig: &'a mut Data,
                                signed_text: Option<&'a mut Data>,
                                plaintext: Option<&'a mut Data>) -> EmptyResult {
        match *self {
            Engine::Gpg {..} => {
                if let Some(plaintext) = plaintext {
                    // Normal or cleartext signature: the verified payload is
                    // written back out
                    driver.add_arg("--output");
                    driver.add_arg("-");
                    driver.add_arg("--");
                    driver.add_data(sig, Some(0), false);
                    driver.add_data(plaintext, Some(1), true);
                } else if let Some(signed_text) = signed_text {
                    driver.add_arg("--verify");
                    driver.add_arg("--");
                    driver.add_data(sig, None, false);
                    driver.add_arg("-");
                    driver.add_data(signed_text, Some(0), false);
                } else {
                    return Err(Error::library(ErrorKind::InvalidValue));
                }
            },
            Engine::Gpgsm {..} => {
                if signed_text.is_some() {
                    return Err(Error::with_message(ErrorKind::NotImplemented, ErrorSource::Library,
                        "gpgsm supports only opaque signatures on a pipe"));
                }
                let plaintext = plaintext.ok_or(Error::library(ErrorKind::InvalidValue))?;

                driver.add_arg("--verify");
                driver.add_arg("--output");
                driver.add_arg("-");
                driver.add_data(sig, Some(0), false);
                driver.add_data(plaintext, Some(1), true);
            },
        }
        Ok(())
    }

    pub(crate) fn op_encrypt<'a>(&self, driver: &mut Driver<'a>, recipients: &[KeyRc],
                                 plain: &'a mut Data, cipher: &'a mut Data,
                                 armor: bool, always_trust: bool) -> EmptyResult {
        let symmetric = recipients.is_empty();

        driver.add_arg(if symmetric {"--symmetric"} else {"--encrypt"});
        if armor {
            driver.add_arg("--armor");
        }

        if !symmetric {
            if always_trust && matches!(*self, Engine::Gpg {..}) {
                driver.add_arg("--always-trust");
            }
            add_recipient_args(driver, recipients)?;
        }

        driver.add_arg("--output");
        driver.add_arg("-");
        driver.add_data(cipher, Some(1), true);
        driver.add_arg("--");
        driver.add_data(plain, Some(0), false);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn op_encrypt_sign<'a>(&self, driver: &mut Driver<'a>, recipients: &[KeyRc],
                                      signers: &[KeyRc], plain: &'a mut Data, cipher: &'a mut Data,
                                      armor: bool, always_trust: bool) -> EmptyResult {
        if let Engine::Gpgsm {..} = *self {
            return Err(Error::library(ErrorKind::NotImplemented));
        }

        driver.add_arg("--encrypt");
        driver.add_arg("--sign");
        if armor {
            driver.add_arg("--armor");
        }
        if always_trust {
            driver.add_arg("--always-trust");
        }

        add_recipient_args(driver, recipients)?;
        add_signer_args(driver, signers)?;

        driver.add_arg("--output");
        driver.add_arg("-");
        driver.add_data(cipher, Some(1), true);
        driver.add_arg("--");
        driver.add_data(plain, Some(0), false);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn op_sign<'a>(&self, driver: &mut Driver<'a>, plain: &'a mut Data,
                              sig: &'a mut Data, mode: SignMode, armor: bool, textmode: bool,
                              signers: &[KeyRc], include_certs: Option<u32>) -> EmptyResult {
        match *self {
            Engine::Gpg {..} => {
                if mode == SignMode::Clear {
                    driver.add_arg("--clearsign");
                } else {
                    driver.add_arg("--sign");
                    if mode == SignMode::Detached {
                        driver.add_arg("--detach");
                    }
                    if armor {
                        driver.add_arg("--armor");
                    }
                    if textmode {
                        driver.add_arg("--textmode");
                    }
                }
            },
            Engine::Gpgsm {..} => {
                if mode == SignMode::Clear {
                    return Err(Error::library(ErrorKind::NotImplemented));
                }

                driver.add_arg("--sign");
                if mode == SignMode::Detached {
                    driver.add_arg("--detached");
                }
                if armor {
                    driver.add_arg("--armor");
                }
                if let Some(count) = include_certs {
                    driver.add_arg("--include-certs");
                    driver.add_arg(count.to_string());
                }
            },
        }

        add_signer_args(driver, signers)?;

        driver.add_data(plain, Some(0), false);
        driver.add_data(sig, Some(1), true);
        Ok(())
    }

    pub(crate) fn op_keylist(&self, driver: &mut Driver, patterns: &[&str],
                             secret_only: bool, with_sigs: bool) -> EmptyResult {
        driver.add_arg("--with-colons");
        if let Engine::Gpg {..} = *self {
            driver.add_arg("--fixed-list-mode");
            driver.add_arg("--with-fingerprint");
        }

        driver.add_arg(if with_sigs {
            match *self {
                Engine::Gpg {..} => "--check-sigs",
                Engine::Gpgsm {..} => return Err(Error::library(ErrorKind::NotImplemented)),
            }
        } else if secret_only {
            "--list-secret-keys"
        } else {
            "--list-keys"
        });

        driver.add_arg("--");
        for pattern in patterns {
            if !pattern.is_empty() {
                driver.add_arg(*pattern);
            }
        }
        Ok(())
    }

    pub(crate) fn op_import<'a>(&self, driver: &mut Driver<'a>, keydata: &'a mut Data) -> EmptyResult {
        driver.add_arg("--import");
        driver.add_data(keydata, Some(0), false);
        Ok(())
    }

    pub(crate) fn op_export<'a>(&self, driver: &mut Driver<'a>, patterns: &[&str],
                                keydata: &'a mut Data, armor: bool) -> EmptyResult {
        driver.add_arg("--export");
        if armor {
            driver.add_arg("--armor");
        }
        driver.add_data(keydata, Some(1), true);
        driver.add_arg("--");
        for pattern in patterns {
            if !pattern.is_empty() {
                driver.add_arg(*pattern);
            }
        }
        Ok(())
    }

    pub(crate) fn op_genkey<'a>(&self, driver: &mut Driver<'a>, params: &'a mut Data,
                                armor: bool) -> EmptyResult {
        driver.add_arg("--gen-key");
        if armor {
            driver.add_arg("--armor");
        }
        driver.add_data(params, Some(0), false);
        Ok(())
    }

    pub(crate) fn op_delete(&self, driver: &mut Driver, fingerprint: &str,
                            allow_secret: bool) -> EmptyResult {
        match *self {
            Engine::Gpg {..} => {
                driver.add_arg(if allow_secret {
                    "--delete-secret-and-public-key"
                } else {
                    "--delete-key"
                });
            },
            Engine::Gpgsm {..} => {
                driver.add_arg("--delete-key");
            },
        }

        driver.add_arg("--");
        driver.add_arg(fingerprint);
        Ok(())
    }

    pub(crate) fn op_trustlist(&self, driver: &mut Driver, pattern: &str) -> EmptyResult {
        if let Engine::Gpgsm {..} = *self {
            return Err(Error::library(ErrorKind::NotImplemented));
        }

        driver.add_arg("--with-colons");
        driver.add_arg("--list-trust-path");
        driver.add_arg("--");
        driver.add_arg(pattern);
        Ok(())
    }

    pub(crate) fn op_edit<'a>(&self, driver: &mut Driver<'a>, fingerprint: &str,
                              out: &'a mut Data, signers: &[KeyRc]) -> EmptyResult {
        if let Engine::Gpgsm {..} = *self {
            return Err(Error::library(ErrorKind::NotImplemented));
        }

        driver.add_arg("--with-colons");
        add_signer_args(driver, signers)?;
        driver.add_arg("--edit-key");

        let slot = driver.add_data(out, Some(1), true);
        driver.link_command_data(slot);

        driver.add_arg("--");
        driver.add_arg(fingerprint);
        Ok(())
    }
}

/// Locale settings forwarded to the engine so that pinentry and diagnostics
/// match the calling application.
#[derive(Debug, Clone, Default)]
pub struct Locale {
    pub ctype: Option<String>,
    pub messages: Option<String>,
}

fn add_signer_args(driver: &mut Driver, signers: &[KeyRc]) -> EmptyResult {
    for key in signers {
        let keyid = key.keyid().ok_or(Error::library(ErrorKind::InvalidValue))?;
        driver.add_arg("-u");
        driver.add_arg(keyid);
    }
    Ok(())
}

fn add_recipient_args(driver: &mut Driver, recipients: &[KeyRc]) -> EmptyResult {
    for key in recipients {
        let name = key.fingerprint().or(key.keyid())
            .ok_or(Error::library(ErrorKind::InvalidValue))?;
        driver.add_arg("-r");
        driver.add_arg(name);
    }
    Ok(())
}
