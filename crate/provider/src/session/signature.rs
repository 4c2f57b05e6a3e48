use std::{ffi::c_void, ptr};

use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    pkey::Id,
    rsa::Padding,
    sign::{RsaPssSaltlen, Verifier},
    x509::X509,
};
use pkcs11_sys::{
    CK_MECHANISM, CK_RSA_PKCS_PSS_PARAMS, CK_RV, CK_ULONG, CKR_BUFFER_TOO_SMALL,
    CKR_MECHANISM_INVALID, CKR_OK, CKU_CONTEXT_SPECIFIC,
};
use tracing::{debug, warn};

use crate::{
    CertificateHandle, HError, HResult, KeyHandle, KeyType, SignatureAlgorithm, SignatureScheme,
    session::session_impl::login_error,
};

/// Size of the buffer ending an aborted signature: an RSA 8192 signature
const MAX_SIGNATURE_LEN: usize = 1024;

impl KeyHandle<'_> {
    /// Sign `data` with this key.
    ///
    /// The digest is computed by the token as part of the mechanism. ECDSA signatures are
    /// returned in the raw PKCS#11 `r || s` form.
    ///
    /// # Errors
    /// * `HError::UnsupportedMechanism` if the token does not advertise the mechanism
    /// * `HError::Authentication` if the key requires a key PIN which is missing or wrong
    /// * `HError::Signing` on any other failure
    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> HResult<Vec<u8>> {
        self.session.require_logged_in()?;
        let mechanisms = self
            .session
            .slot()
            .get_supported_mechanisms()
            .map_err(|e| HError::Signing(format!("cannot list the token mechanisms: {e}")))?;
        if !mechanisms.contains(&algorithm.mechanism()) {
            return Err(HError::UnsupportedMechanism(algorithm));
        }
        check_key_type(self.key_type(), algorithm)?;
        let key_pin = if self.always_authenticate() {
            Some(self.key_pin.as_ref().ok_or_else(|| {
                HError::Authentication(format!("key {} requires a key PIN", self.label()))
            })?)
        } else {
            None
        };

        let hash = algorithm.hash();
        let mut pss_params = CK_RSA_PKCS_PSS_PARAMS {
            hashAlg: hash.mechanism(),
            mgf: hash.mgf(),
            sLen: CK_ULONG::try_from(hash.digest_len())?,
        };
        let mut mechanism = match algorithm.scheme() {
            SignatureScheme::RsaPss => CK_MECHANISM {
                mechanism: algorithm.mechanism(),
                pParameter: (&raw mut pss_params).cast::<c_void>(),
                ulParameterLen: CK_ULONG::try_from(size_of::<CK_RSA_PKCS_PSS_PARAMS>())?,
            },
            SignatureScheme::RsaPkcs1 | SignatureScheme::Ecdsa => CK_MECHANISM {
                mechanism: algorithm.mechanism(),
                pParameter: ptr::null_mut(),
                ulParameterLen: 0,
            },
        };

        let session = self.session;
        let rv = hsm_rv!(
            session.hsm(),
            C_SignInit,
            session.session_handle(),
            &raw mut mechanism,
            self.handle
        );
        match rv {
            CKR_OK => {}
            CKR_MECHANISM_INVALID => return Err(HError::UnsupportedMechanism(algorithm)),
            rv => return Err(signing_error("C_SignInit", rv)),
        }

        if let Some(key_pin) = key_pin {
            let login = match session.call_login(CKU_CONTEXT_SPECIFIC, key_pin) {
                Ok(CKR_OK) => Ok(()),
                Ok(rv) => Err(login_error(rv)),
                Err(e) => Err(e),
            };
            if let Err(e) = login {
                self.abort_signature();
                return Err(e);
            }
        }

        let data_len = CK_ULONG::try_from(data.len())?;
        let mut signature_len: CK_ULONG = 0;
        let rv = hsm_rv!(
            session.hsm(),
            C_Sign,
            session.session_handle(),
            data.as_ptr().cast_mut(),
            data_len,
            ptr::null_mut(),
            &raw mut signature_len
        );
        if rv != CKR_OK {
            return Err(signing_error("C_Sign (length)", rv));
        }
        let mut signature = vec![0_u8; usize::try_from(signature_len)?];
        let rv = hsm_rv!(
            session.hsm(),
            C_Sign,
            session.session_handle(),
            data.as_ptr().cast_mut(),
            data_len,
            signature.as_mut_ptr(),
            &raw mut signature_len
        );
        if rv != CKR_OK {
            return Err(signing_error("C_Sign", rv));
        }
        signature.truncate(usize::try_from(signature_len)?);
        debug!(
            "Signed {} bytes with {algorithm} and key {}",
            data.len(),
            self.label()
        );
        Ok(signature)
    }

    /// End the signing operation initialized on the session.
    ///
    /// Any `C_Sign` call that is not a length query and does not fail with
    /// `CKR_BUFFER_TOO_SMALL` terminates the operation: the buffer fits the largest
    /// signature of the supported algorithms.
    fn abort_signature(&self) {
        let handle = self.session.session_handle();
        match self.call_sign_with_max_buffer() {
            Ok(CKR_BUFFER_TOO_SMALL) | Err(_) => {
                warn!("the signing operation of session {handle} is still active");
            }
            Ok(rv) => debug!("Signing operation of session {handle} terminated ({rv:#x})"),
        }
    }

    fn call_sign_with_max_buffer(&self) -> HResult<CK_RV> {
        let session = self.session;
        let mut signature = vec![0_u8; MAX_SIGNATURE_LEN];
        let mut signature_len = CK_ULONG::try_from(MAX_SIGNATURE_LEN)?;
        Ok(hsm_rv!(
            session.hsm(),
            C_Sign,
            session.session_handle(),
            ptr::null_mut(),
            0,
            signature.as_mut_ptr(),
            &raw mut signature_len
        ))
    }
}

impl CertificateHandle<'_> {
    /// Verify `signature` over `data` with the public key of this certificate.
    ///
    /// Returns `Ok(false)` when the signature does not match.
    ///
    /// # Errors
    /// `HError::Verification` if the certificate cannot be read or parsed, or its key
    /// cannot be used with `algorithm`.
    pub fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> HResult<bool> {
        self.session.require_logged_in()?;
        let der = self.der().map_err(|e| match e {
            HError::Verification(_) => e,
            e => HError::Verification(format!("cannot read certificate {}: {e}", self.label())),
        })?;
        verify_with_certificate(&der, algorithm, data, signature)
    }
}

/// Verify a signature produced by [`KeyHandle::sign`] against a DER certificate.
///
/// ECDSA signatures are expected in the raw `r || s` form; a signature that cannot be
/// decoded is a mismatch, not an error.
pub fn verify_with_certificate(
    certificate_der: &[u8],
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> HResult<bool> {
    let certificate = X509::from_der(certificate_der)
        .map_err(|e| HError::Verification(format!("invalid certificate: {e}")))?;
    let public_key = certificate
        .public_key()
        .map_err(|e| HError::Verification(format!("invalid certificate public key: {e}")))?;
    let expected = match algorithm.scheme() {
        SignatureScheme::RsaPkcs1 | SignatureScheme::RsaPss => Id::RSA,
        SignatureScheme::Ecdsa => Id::EC,
    };
    if public_key.id() != expected {
        return Err(HError::Verification(format!(
            "the certificate key cannot verify {algorithm} signatures"
        )));
    }

    let der_signature;
    let signature = if algorithm.scheme() == SignatureScheme::Ecdsa {
        match ecdsa_raw_to_der(signature)? {
            Some(der) => {
                der_signature = der;
                der_signature.as_slice()
            }
            None => return Ok(false),
        }
    } else {
        signature
    };

    let digest = algorithm.hash().message_digest();
    let openssl_error = |e: openssl::error::ErrorStack| HError::Verification(e.to_string());
    let mut verifier = Verifier::new(digest, &public_key).map_err(openssl_error)?;
    if algorithm.scheme() == SignatureScheme::RsaPss {
        verifier
            .set_rsa_padding(Padding::PKCS1_PSS)
            .map_err(openssl_error)?;
        verifier
            .set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)
            .map_err(openssl_error)?;
        verifier.set_rsa_mgf1_md(digest).map_err(openssl_error)?;
    }
    verifier.update(data).map_err(openssl_error)?;
    verifier.verify(signature).map_err(openssl_error)
}

/// Convert a raw `r || s` ECDSA signature to its DER encoding.
///
/// `None` if the input cannot be a raw signature.
fn ecdsa_raw_to_der(signature: &[u8]) -> HResult<Option<Vec<u8>>> {
    if signature.is_empty() || signature.len() % 2 != 0 {
        return Ok(None);
    }
    let (r, s) = signature.split_at(signature.len() / 2);
    let to_bn = |bytes: &[u8]| {
        BigNum::from_slice(bytes).map_err(|e| HError::Verification(e.to_string()))
    };
    let der = EcdsaSig::from_private_components(to_bn(r)?, to_bn(s)?)
        .and_then(|sig| sig.to_der())
        .map_err(|e| HError::Verification(e.to_string()))?;
    Ok(Some(der))
}

fn check_key_type(key_type: KeyType, algorithm: SignatureAlgorithm) -> HResult<()> {
    let compatible = matches!(
        (key_type, algorithm.scheme()),
        (
            KeyType::Rsa,
            SignatureScheme::RsaPkcs1 | SignatureScheme::RsaPss
        ) | (KeyType::Ec, SignatureScheme::Ecdsa)
    );
    if compatible {
        Ok(())
    } else {
        Err(HError::Signing(format!(
            "a {key_type:?} key cannot sign with {algorithm}"
        )))
    }
}

fn signing_error(step: &str, rv: CK_RV) -> HError {
    HError::Signing(format!("{step} failed with return code {rv:#x}"))
}
