//! Scenarios run against a real token by the module crates.
//! Each module crate builds an [`HsmTestConfig`] from its environment and delegates here.
#![allow(clippy::panic_in_result_fn)]
#![allow(clippy::missing_panics_doc)]

use std::{ptr, thread, time::Duration};

use rand::{TryRngCore, rngs::OsRng};
use softhsm_provider_logger::{debug, info, log_init};

use crate::{
    HError, HResult, KeyType, Pkcs11Provider, SessionState, SignatureAlgorithm,
    SignatureScheme, test_helpers::HsmTestConfig,
};

fn generate_random_data<const T: usize>() -> HResult<[u8; T]> {
    let mut bytes = [0_u8; T];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| HError::Default(format!("Error generating random data: {e}")))?;
    Ok(bytes)
}

/// The slot under test: `HSM_SLOT_ID` if set, the configured slot otherwise.
pub fn slot_id(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<usize> {
    let slot_id = match cfg.slot_id {
        Some(slot_id) => slot_id,
        None => provider.default_slot_id()?,
    };
    debug!("Testing slot {slot_id}");
    Ok(slot_id)
}

/// Loading twice yields the same provider and initializes the module once.
pub fn load_is_idempotent<'a, F>(load: F) -> HResult<&'a Pkcs11Provider>
where
    F: Fn() -> HResult<&'a Pkcs11Provider>,
{
    log_init(None);
    let first = load()?;
    let second = load()?;
    assert!(ptr::eq(first, second));
    assert!(first.name().starts_with(crate::PROVIDER_NAME_PREFIX));
    info!("Provider {} loaded once", first.name());
    Ok(first)
}

pub fn get_info(provider: &Pkcs11Provider) -> HResult<()> {
    log_init(None);
    let info = provider.get_info()?;
    info!("Connected to the module: {info}");
    assert!(info.cryptoki_version.0 >= 2);
    Ok(())
}

pub fn supported_signature_algorithms(
    provider: &Pkcs11Provider,
    cfg: &HsmTestConfig,
) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    let mut mechanisms = provider.get_slot(slot_id)?.get_supported_mechanisms()?;
    mechanisms.sort_unstable();
    debug!("Supported mechanisms: {mechanisms:?}");
    let algorithms = provider.get_supported_signature_algorithms(slot_id)?;
    info!(
        "Supported signature algorithms: {}",
        algorithms
            .iter()
            .copied()
            .map(SignatureAlgorithm::name)
            .collect::<Vec<_>>()
            .join(", ")
    );
    for algorithm in SignatureAlgorithm::ALL {
        assert!(
            algorithms.contains(&algorithm),
            "{algorithm} is not advertised by slot {slot_id}"
        );
    }
    Ok(())
}

pub fn login_close_relogin(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;

    let mut session = provider.open_session(slot_id)?;
    assert_eq!(session.state(), SessionState::Open);
    session.login(&cfg.token_pass)?;
    assert_eq!(session.state(), SessionState::LoggedIn);
    assert!(matches!(
        session.login(&cfg.token_pass),
        Err(HError::AlreadyLoggedIn(_))
    ));
    session.close()?;
    assert_eq!(session.state(), SessionState::Closed);
    // closing twice is a no-op
    session.close()?;
    assert!(matches!(
        session.login(&cfg.token_pass),
        Err(HError::SessionState(_))
    ));

    let mut session = provider.open_session(slot_id)?;
    session.login(&cfg.token_pass)?;
    let (key, _certificate) = session.find_key_and_certificate(&cfg.key_alias)?;
    info!("Found {:?} key {} after a new login", key.key_type(), key.label());
    session.close()?;
    Ok(())
}

/// Tokens share the user login between the sessions of a process: this must run while
/// no other session is logged in. A session joining that login must present its PIN.
pub fn wrong_pin_is_rejected(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    let mut session = provider.open_session(slot_id)?;
    let wrong_pin = format!("wrong-{}", cfg.token_pass.as_str());
    let res = session.login(&wrong_pin);
    assert!(
        matches!(res, Err(HError::Authentication(_))),
        "unexpected login result: {res:?}"
    );
    assert_eq!(session.state(), SessionState::Open);
    assert!(matches!(
        session.find_key_and_certificate(&cfg.key_alias),
        Err(HError::SessionState(_))
    ));

    // the token accepts any PIN for a login it already holds
    let mut holder = provider.open_session(slot_id)?;
    holder.login(&cfg.token_pass)?;
    let res = session.login(&wrong_pin);
    assert!(
        matches!(res, Err(HError::Authentication(_))),
        "unexpected login result: {res:?}"
    );
    session.login(&cfg.token_pass)?;
    assert_eq!(session.state(), SessionState::LoggedIn);

    session.close()?;
    holder.close()?;
    Ok(())
}

pub fn find_key_and_certificate(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    provider.with_session(slot_id, &cfg.token_pass, |session| {
        let (key, certificate) = session.find_key_and_certificate(&cfg.key_alias)?;
        assert_eq!(key.label(), cfg.key_alias);
        assert_eq!(certificate.label(), cfg.key_alias);
        assert!(matches!(key.key_type(), KeyType::Rsa | KeyType::Ec));
        assert!(!certificate.der()?.is_empty());

        let unknown = format!("{}-unknown", cfg.key_alias);
        assert!(matches!(
            session.find_key_and_certificate(&unknown),
            Err(HError::KeyNotFound(label)) if label == unknown
        ));
        Ok(())
    })
}

/// Sign and verify with every advertised algorithm matching the key, and check that
/// tampered data does not verify.
pub fn sign_and_verify(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    let algorithms = provider.get_supported_signature_algorithms(slot_id)?;
    provider.with_session(slot_id, &cfg.token_pass, |session| {
        let (key, certificate) = session.find_key_and_certificate(&cfg.key_alias)?;
        let key = key.with_key_pin(&cfg.key_pass);
        let compatible: Vec<SignatureAlgorithm> = algorithms
            .iter()
            .copied()
            .filter(|algorithm| {
                matches!(
                    (key.key_type(), algorithm.scheme()),
                    (KeyType::Rsa, SignatureScheme::RsaPkcs1 | SignatureScheme::RsaPss)
                        | (KeyType::Ec, SignatureScheme::Ecdsa)
                )
            })
            .collect();
        assert!(!compatible.is_empty());

        let data = generate_random_data::<64>()?;
        for algorithm in compatible {
            let signature = key.sign(algorithm, &data)?;
            assert!(!signature.is_empty());
            assert!(certificate.verify(algorithm, &data, &signature)?);

            let mut tampered = data;
            tampered[0] ^= 0x01;
            assert!(!certificate.verify(algorithm, &tampered, &signature)?);
            info!("{algorithm}: sign and verify OK");
        }
        Ok(())
    })
}

/// Sign 16 random bytes with SHA256withRSA and verify the signature.
pub fn sign_random_data_sha256_rsa(
    provider: &Pkcs11Provider,
    cfg: &HsmTestConfig,
) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    provider.with_session(slot_id, &cfg.token_pass, |session| {
        let (key, certificate) = session.find_key_and_certificate(&cfg.key_alias)?;
        if key.key_type() != KeyType::Rsa {
            info!("key {} is not an RSA key, skipping", key.label());
            return Ok(());
        }
        let key = key.with_key_pin(&cfg.key_pass);
        let data = session.generate_random(16)?;
        assert_eq!(data.len(), 16);
        let algorithm: SignatureAlgorithm = "SHA256withRSA".parse()?;
        let signature = key.sign(algorithm, &data)?;
        assert!(certificate.verify(algorithm, &data, &signature)?);
        Ok(())
    })
}

/// Several threads each sign in their own session.
pub fn multi_threaded_signatures(
    provider: &Pkcs11Provider,
    cfg: &HsmTestConfig,
    threads: usize,
) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                scope.spawn(move || {
                    provider.with_session(slot_id, &cfg.token_pass, |session| {
                        let (key, certificate) =
                            session.find_key_and_certificate(&cfg.key_alias)?;
                        let key = key.with_key_pin(&cfg.key_pass);
                        let algorithm = match key.key_type() {
                            KeyType::Ec => SignatureAlgorithm::Sha256WithEcdsa,
                            _ => SignatureAlgorithm::Sha256WithRsa,
                        };
                        let data = generate_random_data::<32>()?;
                        let signature = key.sign(algorithm, &data)?;
                        assert!(certificate.verify(algorithm, &data, &signature)?);
                        debug!("thread {i} signed with {algorithm}");
                        Ok(())
                    })
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| HError::Default("signing thread panicked".to_owned()))??;
        }
        Ok(())
    })
}

pub fn session_timeout(provider: &Pkcs11Provider, cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let slot_id = slot_id(provider, cfg)?;
    let random = provider.with_session_timeout(
        slot_id,
        &cfg.token_pass,
        Duration::from_secs(30),
        |session| session.generate_random(32),
    )?;
    assert_eq!(random.len(), 32);

    let res = provider.with_session_timeout(
        slot_id,
        &cfg.token_pass,
        Duration::from_millis(10),
        |session| {
            thread::sleep(Duration::from_millis(500));
            session.generate_random(8)
        },
    );
    assert!(matches!(res, Err(HError::Timeout(_))));
    // let the abandoned worker close its session
    thread::sleep(Duration::from_secs(1));
    Ok(())
}
