use pkcs11_sys::CK_RV;
use thiserror::Error;

use crate::SignatureAlgorithm;

pub type HResult<T> = Result<T, HError>;

#[derive(Error, Debug)]
pub enum HError {
    #[error("{0}")]
    Default(String),

    #[error("Error loading the PKCS#11 module: {0}")]
    ModuleLoad(String),

    #[error("Invalid module configuration: {0}")]
    Config(String),

    #[error("Slot {0} not found or has no token present")]
    SlotNotFound(usize),

    #[error("No slot with a token present at index {0} of the slot list")]
    SlotIndexNotFound(usize),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Session {0} is already logged in")]
    AlreadyLoggedIn(u64),

    #[error("Invalid session state: {0}")]
    SessionState(String),

    #[error("No private key found with label: {0}")]
    KeyNotFound(String),

    #[error("No certificate found with label: {0}")]
    CertificateNotFound(String),

    #[error("Mechanism {0} is not supported by the token")]
    UnsupportedMechanism(SignatureAlgorithm),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{context}: PKCS#11 return code {rv:#x}")]
    Pkcs11 { context: String, rv: CK_RV },

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl From<libloading::Error> for HError {
    fn from(e: libloading::Error) -> Self {
        Self::ModuleLoad(e.to_string())
    }
}
