//! PKCS#11 signing client.
//!
//! Loads a PKCS#11 module once per process ([`ProviderRegistry`]), opens and logs
//! into sessions on its token slots ([`Session`]), locates a private key and its
//! certificate by label, signs on the token and verifies against the certificate.

#![allow(non_snake_case)]

#[macro_use]
mod macros;

mod algorithms;
mod config;
mod error;
#[cfg(test)]
mod fake_module;
mod hsm_lib;
mod provider;
mod registry;
mod session;
mod slots;

pub mod test_helpers;
pub mod tests_shared;

pub use algorithms::{HashAlgorithm, SignatureAlgorithm, SignatureScheme};
pub use config::{
    DEFAULT_CONF_PATH, DEFAULT_MODULE_NAME, HSM_CONF_ENV, ModuleConfig, PROVIDER_NAME_PREFIX,
    SlotSelection,
};
pub use error::{HError, HResult};
pub use provider::{Info, Pkcs11Provider};
pub use registry::{ProviderRegistry, RegisteredProvider};
pub use session::{
    CertificateHandle, KeyHandle, KeyType, Session, SessionState, verify_with_certificate,
};
pub use slots::Slot;
