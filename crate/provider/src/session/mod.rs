mod objects;
mod session_impl;
mod signature;

pub use objects::{CertificateHandle, KeyHandle, KeyType};
pub use session_impl::{Session, SessionState};
pub use signature::verify_with_certificate;
