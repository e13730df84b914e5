use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use assert_fs::TempDir;
use indoc::indoc;

use crate::context::{Context, Event, Interactor};
use crate::core::{EmptyResult, ErrorKind, OpResult};
use crate::data::{self, Data};
use crate::engine::Protocol;
use crate::engine::status::StatusCode;
use crate::key::{Key, KeyRc, Subkey};
use crate::ops::SignMode;

// A scripted stand-in for gpg: parses the fd plan from its arguments the
// same way the real engine does and talks the status-fd protocol back.
const PRELUDE: &str = r#"#!/bin/bash

printf '%s\n' "$@" > "$0.args"

status_fd=2
command_fd=
special_fd=
args=("$@")
for ((i = 0; i < $#; i++)); do
    case "${args[i]}" in
        --status-fd) status_fd=${args[i+1]};;
        --command-fd) command_fd=${args[i+1]};;
        -\&*) special_fd=${args[i]#-&};;
    esac
done

st() {
    printf '[GNUPG:] %s\n' "$1" >&"$status_fd"
}

ask() {
    st "$1"
    IFS= read -r reply <&"$command_fd"
}
"#;

struct FakeEngine {
    // Kept alive for the duration of the test
    _dir: TempDir,
    path: PathBuf,
}

impl FakeEngine {
    fn new(body: &str) -> FakeEngine {
        setup_logging();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-engine");

        fs::write(&path, format!("{}\n{}\n", PRELUDE, body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        FakeEngine {_dir: dir, path}
    }

    fn context(&self) -> Context {
        let mut ctx = Context::new(Protocol::OpenPgp);
        ctx.set_engine_path(&self.path);
        ctx
    }

    fn args(&self) -> Vec<String> {
        let dump = fs::read_to_string(self.path.with_file_name("fake-engine.args")).unwrap();
        dump.lines().map(ToOwned::to_owned).collect()
    }
}

fn setup_logging() {
    static LOGGING: Once = Once::new();
    LOGGING.call_once(|| {
        if option_env!("GPGRUN_TESTS_LOGGING") == Some("y") {
            easy_logging::init(module_path!().split("::").next().unwrap(), log::Level::Trace).unwrap();
        }
    });
}

fn test_key(keyid: &str, fingerprint: &str) -> KeyRc {
    Arc::new(Key {
        subkeys: vec![Subkey {
            keyid: keyid.to_owned(),
            fingerprint: Some(fingerprint.to_owned()),
            ..Default::default()
        }],
        ..Default::default()
    })
}

#[test]
fn decrypt_with_passphrase_inquiry() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "ENC_TO 6AE6D7EE46A871F8 1 0"
        st "USERID_HINT 6AE6D7EE46A871F8 Bob (demo key)"
        st "NEED_PASSPHRASE 6AE6D7EE46A871F8 6AE6D7EE46A871F8 1 0"
        ask "GET_HIDDEN passphrase.enter"
        if [ "$reply" != "abc" ]; then
            st "BAD_PASSPHRASE 6AE6D7EE46A871F8"
            st "DECRYPTION_FAILED"
            exit 2
        fi
        st "GOOD_PASSPHRASE"
        st "DECRYPTION_INFO 2 9"
        st "PLAINTEXT 62 1638282249 plain.txt"
        printf 'Hallo Leute\n'
        st "DECRYPTION_OKAY"
        st "END_DECRYPTION"
    "#));

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = engine.context();
    {
        let prompts = prompts.clone();
        ctx.set_passphrase_provider(move |request: &crate::PassphrasePrompt| -> OpResult<String> {
            prompts.lock().unwrap().push(request.prompt.clone());
            Ok("abc".to_owned())
        });
    }

    let mut cipher = Data::from_bytes(b"fake ciphertext!");
    let mut plain = Data::new();
    ctx.decrypt(&mut cipher, &mut plain)?;

    let result = ctx.decrypt_result().unwrap();
    assert_eq!(result.symkey_algo, "AES256.CFB");
    assert_eq!(result.file_name.as_deref(), Some("plain.txt"));
    assert!(!result.is_mime);
    assert_eq!(result.recipients.len(), 1);

    assert_eq!(plain.into_bytes().unwrap(), b"Hallo Leute\n");

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].lines().next().unwrap(), "ENTER");
    assert!(prompts[0].contains("Bob (demo key)"));

    Ok(())
}

#[test]
fn decrypt_passphrase_retry() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "USERID_HINT 6AE6D7EE46A871F8 Bob (demo key)"
        st "NEED_PASSPHRASE 6AE6D7EE46A871F8 6AE6D7EE46A871F8 1 0"
        ask "GET_HIDDEN passphrase.enter"
        st "BAD_PASSPHRASE 6AE6D7EE46A871F8"
        st "NEED_PASSPHRASE 6AE6D7EE46A871F8 6AE6D7EE46A871F8 1 0"
        ask "GET_HIDDEN passphrase.enter"
        if [ "$reply" = "right" ]; then
            st "GOOD_PASSPHRASE"
            printf 'ok'
            st "DECRYPTION_OKAY"
        fi
    "#));

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = engine.context();
    {
        let prompts = prompts.clone();
        ctx.set_passphrase_provider(move |request: &crate::PassphrasePrompt| -> OpResult<String> {
            let mut prompts = prompts.lock().unwrap();
            prompts.push(request.prompt.clone());
            Ok(match prompts.len() {
                1 => "wrong".to_owned(),
                _ => "right".to_owned(),
            })
        });
    }

    let mut cipher = Data::from_bytes(b"fake ciphertext!");
    let mut plain = Data::new();
    ctx.decrypt(&mut cipher, &mut plain)?;

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].starts_with("ENTER\n"));
    assert!(prompts[1].starts_with("TRY_AGAIN\n"));

    assert_eq!(plain.into_bytes().unwrap(), b"ok");
    Ok(())
}

#[test]
fn decrypt_without_integrity_protection() {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "DECRYPTION_INFO 0 3"
        printf 'leaked plaintext'
        st "DECRYPTION_FAILED"
        exit 2
    "#));

    let mut ctx = engine.context();
    let mut cipher = Data::from_bytes(b"mdc-less ciphertext");
    let mut plain = Data::new();

    let err = ctx.decrypt(&mut cipher, &mut plain).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecryptionFailed);

    let result = ctx.decrypt_result().unwrap();
    assert!(result.not_integrity_protected);
    assert_eq!(result.symkey_algo, "CAST5.PGPCFB");

    // The unauthenticated plaintext must not be observable
    assert!(data::get_blankout(plain.serial()));
    assert_eq!(plain.read(&mut [0; 64]).unwrap(), 0);
    assert_eq!(plain.into_bytes().unwrap(), b"");
}

#[test]
fn keylist() -> OpResult<()> {
    let engine = FakeEngine::new(indoc!(r#"
        echo "tru::1:1695554253:0:3:1:5"
        echo "pub:u:1024:17:A0FF4590BB6122ED:920716800:::u:::scESC::::::"
        echo "fpr:::::::::A0FF4590BB6122EDEF6E3C542D727CC768697734:"
        echo "uid:u::::1695554236::CC265AE79E3E13E363CDAC0F688B6BD242B7CAF8::Alfa Test (demo key) <alfa@example.net>::::::::::0:"
        echo "uid:u::::1695554236::B9B49B7A6B087D5DD68344CDBA67C85A08CC28CB::Alpha Test (demo key) <alpha@example.net>::::::::::0:"
        echo "sub:u:1024:16:3B3FBC948FE59301:920716800::::::e::::::"
        echo "fpr:::::::::9277D8A8AA26D2DD2ABEB7C7E20DF3E28F6FFF9B:"
    "#));

    let mut ctx = engine.context();

    let next_keys = Arc::new(Mutex::new(0));
    {
        let next_keys = next_keys.clone();
        ctx.set_event_sink(Box::new(move |event| {
            if let Event::NextKey(_) = event {
                *next_keys.lock().unwrap() += 1;
            }
        }));
    }

    let keys = ctx.keylist(Some("alfa@example.net"), false)?;

    let args = engine.args();
    let tail: Vec<&str> = args.iter().map(String::as_str)
        .skip_while(|&arg| arg != "--with-colons").collect();
    assert_eq!(tail, vec![
        "--with-colons", "--fixed-list-mode", "--with-fingerprint",
        "--list-keys", "--", "alfa@example.net",
    ]);

    assert_eq!(*next_keys.lock().unwrap(), 1);
    assert_eq!(keys.len(), 1);

    let key = &keys[0];
    assert_eq!(key.keyid().unwrap().len(), 16);
    assert_eq!(key.fingerprint(), Some("A0FF4590BB6122EDEF6E3C542D727CC768697734"));
    assert_eq!(key.user_ids.len(), 2);
    assert_eq!(key.subkeys.len(), 2);
    assert!(!ctx.keylist_result().unwrap().truncated);

    Ok(())
}

#[test]
fn sign_detached_with_two_signers() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "SIG_CREATED D 17 8 01 1638282249 A0FF4590BB6122EDEF6E3C542D727CC768697734"
        st "SIG_CREATED D 1 8 01 1638282249 23FD347A419429BACCD5E72D6BC4778054ACD246"
        printf -- '-----BEGIN PGP SIGNATURE-----'
    "#));

    let mut ctx = engine.context();
    ctx.set_armor(true);
    ctx.add_signer(test_key("2D727CC768697734", "A0FF4590BB6122EDEF6E3C542D727CC768697734"));
    ctx.add_signer(test_key("6BC4778054ACD246", "23FD347A419429BACCD5E72D6BC4778054ACD246"));

    let mut plain = Data::from_bytes(b"Hallo Leute\n");
    let mut sig = Data::new();
    ctx.sign(&mut plain, &mut sig, SignMode::Detached)?;

    let args = engine.args();
    let tail: Vec<&str> = args.iter().map(String::as_str)
        .skip_while(|&arg| arg != "--sign").collect();
    assert_eq!(tail, vec![
        "--sign", "--detach", "--armor",
        "-u", "2D727CC768697734",
        "-u", "6BC4778054ACD246",
    ]);

    let result = ctx.sign_result().unwrap();
    assert_eq!(result.signatures.len(), 2);
    for signature in &result.signatures {
        assert_eq!(signature.mode, SignMode::Detached);
        assert_eq!(signature.class, 1);
    }
    assert_eq!(result.signatures[0].fingerprint, "A0FF4590BB6122EDEF6E3C542D727CC768697734");
    assert_eq!(result.signatures[1].fingerprint, "23FD347A419429BACCD5E72D6BC4778054ACD246");

    assert!(sig.into_bytes().unwrap().starts_with(b"-----BEGIN PGP SIGNATURE-----"));
    Ok(())
}

#[test]
fn verify_detached_tampered_text() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        cat <&"$special_fd" > /dev/null
        cat > /dev/null
        st "BADSIG 2D727CC768697734 Alfa Test <alfa@example.net>"
        exit 1
    "#));

    let mut ctx = engine.context();
    let mut sig = Data::from_bytes(b"detached signature bytes");
    let mut text = Data::from_bytes(b"tampered signed tExt");

    // The operation itself succeeds; the verdict lives in the result
    ctx.verify(&mut sig, Some(&mut text), None)?;

    let args = engine.args();
    assert!(args.contains(&"--enable-special-filenames".to_owned()));
    let position = args.iter().position(|arg| arg == "--verify").unwrap();
    assert_eq!(args[position + 1], "--");
    assert!(args[position + 2].starts_with("-&"));
    assert_eq!(args[position + 3], "-");

    let signatures = &ctx.verify_result().unwrap().signatures;
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].status, crate::SigStatus::Bad);
    assert_eq!(signatures[0].fingerprint, "2D727CC768697734");
    assert!(signatures[0].summary.contains(crate::SigSummary::RED));

    Ok(())
}

#[test]
fn encrypt_pumps_all_data() -> EmptyResult {
    // The "engine" copies its input back out, so everything the pumps do is
    // byte-exact observable, including backpressure on large payloads
    let engine = FakeEngine::new(indoc!(r#"
        st "BEGIN_ENCRYPTION 2 9"
        cat
        st "END_ENCRYPTION"
    "#));

    let payload: Vec<u8> = (0..256 * 1024).map(|index| (index % 251) as u8).collect();

    let mut ctx = engine.context();
    let recipients = vec![test_key("2D727CC768697734", "A0FF4590BB6122EDEF6E3C542D727CC768697734")];

    let mut plain = Data::from_vec(payload.clone());
    let mut cipher = Data::new();
    ctx.encrypt(&recipients, &mut plain, &mut cipher)?;

    let args = engine.args();
    let position = args.iter().position(|arg| arg == "-r").unwrap();
    assert_eq!(args[position + 1], "A0FF4590BB6122EDEF6E3C542D727CC768697734");

    assert_eq!(cipher.into_bytes().unwrap(), payload);
    Ok(())
}

#[test]
fn encrypt_without_usable_recipients() {
    let engine = FakeEngine::new(indoc!(r#"
        st "INV_RECP 1 nosuchname@example.net"
        st "NO_RECP 0"
        exit 2
    "#));

    let mut ctx = engine.context();
    let recipients = vec![test_key("2D727CC768697734", "A0FF4590BB6122EDEF6E3C542D727CC768697734")];

    let mut plain = Data::from_bytes(b"payload");
    let mut cipher = Data::new();

    let err = ctx.encrypt(&recipients, &mut plain, &mut cipher).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoPublicKey);
    assert!(ctx.encrypt_result().unwrap().no_recipients);
}

#[test]
fn import_keys() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "IMPORT_OK 1 A0FF4590BB6122EDEF6E3C542D727CC768697734"
        st "IMPORT_PROBLEM 1 0000000000000000000000000000000000000000"
        st "IMPORT_RES 2 0 1 0 0 0 0 0 0 0 0 1"
    "#));

    let mut ctx = engine.context();
    let mut keydata = Data::from_bytes(b"-----BEGIN PGP PUBLIC KEY BLOCK-----");
    ctx.import(&mut keydata)?;

    let result = ctx.import_result().unwrap();
    assert_eq!(result.considered, 2);
    assert_eq!(result.imported, 1);
    assert_eq!(result.not_imported, 1);
    assert_eq!(result.imports.len(), 2);

    Ok(())
}

#[test]
fn cancellation() {
    let engine = FakeEngine::new(indoc!(r#"
        st "BEGIN_DECRYPTION"
        sleep 10
        st "DECRYPTION_OKAY"
    "#));

    let mut ctx = engine.context();
    let handle = ctx.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        handle.cancel();
    });

    let start = Instant::now();
    let mut cipher = Data::from_bytes(b"ciphertext");
    let mut plain = Data::new();

    let err = ctx.decrypt(&mut cipher, &mut plain).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(start.elapsed() < Duration::from_secs(5));

    canceller.join().unwrap();
}

#[test]
fn edit_with_linked_output() -> EmptyResult {
    let engine = FakeEngine::new(indoc!(r#"
        printf 'pub:u:1024:17:A0FF4590BB6122ED:\n'
        ask "GET_LINE keyedit.prompt"
        printf 'fpr:::::::::A0FF4590BB6122EDEF6E3C542D727CC768697734:\n'
        ask "GET_LINE keyedit.prompt"
        ask "GET_BOOL keyedit.save.okay"
    "#));

    struct Script {
        replies: Vec<&'static str>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Interactor for Script {
        fn reply(&mut self, code: StatusCode, keyword: &str) -> OpResult<String> {
            self.seen.lock().unwrap().push(format!("{:?} {}", code, keyword));
            Ok(self.replies.remove(0).to_owned())
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let script = Script {
        replies: vec!["fpr", "quit", "Y"],
        seen: seen.clone(),
    };

    let mut ctx = engine.context();
    let key = test_key("A0FF4590BB6122ED", "A0FF4590BB6122EDEF6E3C542D727CC768697734");

    let mut out = Data::new();
    ctx.edit(&key, Box::new(script), &mut out)?;

    assert_eq!(*seen.lock().unwrap(), vec![
        "GetLine keyedit.prompt",
        "GetLine keyedit.prompt",
        "GetBool keyedit.save.okay",
    ]);

    let out = String::from_utf8(out.into_bytes().unwrap()).unwrap();
    assert!(out.starts_with("pub:"));
    assert!(out.contains("fpr:"));

    Ok(())
}

#[test]
fn missing_passphrase() {
    let engine = FakeEngine::new(indoc!(r#"
        cat > /dev/null
        st "MISSING_PASSPHRASE"
        exit 2
    "#));

    let mut ctx = engine.context();
    ctx.set_passphrase_provider(|_request: &crate::PassphrasePrompt| -> OpResult<String> {
        Ok(String::new())
    });
    ctx.add_signer(test_key("2D727CC768697734", "A0FF4590BB6122EDEF6E3C542D727CC768697734"));

    let mut plain = Data::from_bytes(b"payload");
    let mut sig = Data::new();

    let err = ctx.sign(&mut plain, &mut sig, SignMode::Normal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadPassphrase);
}
