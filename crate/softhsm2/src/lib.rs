//! The SoftHSM2 provider of the process.
//!
//! The module configuration is read once, from the file named by `HSM_CONF` or from
//! [`SOFTHSM2_DEFAULT_CONF`], and the module stays loaded until the process exits.

use std::path::PathBuf;

use pkcs11_provider::{HResult, HSM_CONF_ENV, Pkcs11Provider, ProviderRegistry};
use tracing::debug;


pub use pkcs11_provider::DEFAULT_CONF_PATH as SOFTHSM2_DEFAULT_CONF;

static REGISTRY: ProviderRegistry = ProviderRegistry::new();

pub fn registry() -> &'static ProviderRegistry {
    &REGISTRY
}

/// The SoftHSM2 provider, loaded on first use.
///
/// # Errors
/// The configuration or module loading error, as long as no provider is registered.
pub fn provider() -> HResult<&'static Pkcs11Provider> {
    load_provider(None)
}

/// Load the provider from an explicit module configuration file.
///
/// Without `conf`, a registered provider is reused as is. With it, the configuration
/// must match the one of the registered provider.
pub fn load_provider(conf: Option<PathBuf>) -> HResult<&'static Pkcs11Provider> {
    debug!("Resolving the SoftHSM2 provider (configuration: {conf:?})");
    REGISTRY.load_module(conf, HSM_CONF_ENV, SOFTHSM2_DEFAULT_CONF)
}
