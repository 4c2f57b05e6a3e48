use std::ffi::c_void;

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_KEY_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_ULONG,
    CKA_ALWAYS_AUTHENTICATE, CKA_CLASS, CKA_KEY_TYPE, CKA_LABEL, CKA_VALUE, CKK_EC, CKK_RSA,
    CKO_CERTIFICATE, CKO_PRIVATE_KEY,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{HError, HResult, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
    Other(CK_KEY_TYPE),
}

impl From<CK_KEY_TYPE> for KeyType {
    fn from(key_type: CK_KEY_TYPE) -> Self {
        match key_type {
            CKK_RSA => Self::Rsa,
            CKK_EC => Self::Ec,
            other => Self::Other(other),
        }
    }
}

/// A private key object of a logged in session.
///
/// The handle borrows its session: it cannot be kept once the session is closed.
pub struct KeyHandle<'s> {
    pub(crate) session: &'s Session,
    pub(crate) handle: CK_OBJECT_HANDLE,
    label: String,
    key_type: KeyType,
    always_authenticate: bool,
    pub(crate) key_pin: Option<Zeroizing<String>>,
}

impl KeyHandle<'_> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Whether the token asks for the key PIN before each signature.
    pub const fn always_authenticate(&self) -> bool {
        self.always_authenticate
    }

    /// Attach the PIN protecting the key itself.
    ///
    /// It is only sent to the token, as a context specific login, for keys that
    /// require it (`CKA_ALWAYS_AUTHENTICATE`).
    #[must_use]
    pub fn with_key_pin(mut self, key_pin: &str) -> Self {
        self.key_pin = Some(Zeroizing::new(key_pin.to_owned()));
        self
    }
}

/// A certificate object, located with the same label as its private key.
pub struct CertificateHandle<'s> {
    pub(crate) session: &'s Session,
    pub(crate) handle: CK_OBJECT_HANDLE,
    label: String,
}

impl CertificateHandle<'_> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The DER encoding of the certificate (`CKA_VALUE`).
    pub fn der(&self) -> HResult<Vec<u8>> {
        self.session
            .get_attribute_bytes(self.handle, CKA_VALUE)?
            .filter(|der| !der.is_empty())
            .ok_or_else(|| {
                HError::Verification(format!("certificate {} has no value", self.label))
            })
    }
}

impl Session {
    /// Find the private key labelled `label` and the certificate with the same label.
    ///
    /// Both objects must exist: a key without its certificate is an error, since
    /// signatures cannot be verified without the certificate.
    ///
    /// # Errors
    /// * `HError::SessionState` if the session is not logged in
    /// * `HError::KeyNotFound` if no private key has this label
    /// * `HError::CertificateNotFound` if no certificate has this label
    pub fn find_key_and_certificate(
        &self,
        label: &str,
    ) -> HResult<(KeyHandle<'_>, CertificateHandle<'_>)> {
        self.require_logged_in()?;

        let key = self
            .find_by_class_and_label(CKO_PRIVATE_KEY, label)?
            .ok_or_else(|| HError::KeyNotFound(label.to_owned()))?;
        let certificate = self
            .find_by_class_and_label(CKO_CERTIFICATE, label)?
            .ok_or_else(|| HError::CertificateNotFound(label.to_owned()))?;

        let key_type = self
            .get_ulong_attribute(key, CKA_KEY_TYPE)?
            .map_or(KeyType::Other(CK_KEY_TYPE::MAX), KeyType::from);
        let always_authenticate = self
            .get_bool_attribute(key, CKA_ALWAYS_AUTHENTICATE)?
            .unwrap_or(false);
        debug!(
            "Found {key_type:?} key {key} and certificate {certificate} for label {label}"
        );

        Ok((
            KeyHandle {
                session: self,
                handle: key,
                label: label.to_owned(),
                key_type,
                always_authenticate,
                key_pin: None,
            },
            CertificateHandle {
                session: self,
                handle: certificate,
                label: label.to_owned(),
            },
        ))
    }

    fn find_by_class_and_label(
        &self,
        class: CK_OBJECT_CLASS,
        label: &str,
    ) -> HResult<Option<CK_OBJECT_HANDLE>> {
        let mut class = class;
        let mut template = [
            CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: (&raw mut class).cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(size_of::<CK_OBJECT_CLASS>())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_ptr().cast::<c_void>().cast_mut(),
                ulValueLen: CK_ULONG::try_from(label.len())?,
            },
        ];
        let handles = self.find_object_handles(&mut template)?;
        if handles.len() > 1 {
            debug!(
                "{} objects of class {class} share the label {label}, using the first one",
                handles.len()
            );
        }
        Ok(handles.first().copied())
    }
}
