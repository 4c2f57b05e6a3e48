//! Process-wide provider registration.
//!
//! A [`ProviderRegistry`] holds at most one provider. Readers go through a lock-free
//! [`OnceLock::get`]; only the first registration takes the init guard, and the
//! provider is built exactly once even when several threads race to register it.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use tracing::info;

use crate::{HError, HResult, ModuleConfig, Pkcs11Provider};

/// What the registry needs to know about a provider.
///
/// Implemented by [`Pkcs11Provider`]; tests plug a fake provider in instead of a
/// native module.
pub trait RegisteredProvider: Send + Sync {
    fn name(&self) -> &str;
    fn config(&self) -> &ModuleConfig;
}

pub struct ProviderRegistry<P = Pkcs11Provider> {
    provider: OnceLock<P>,
    init_guard: Mutex<()>,
}

impl<P> Default for ProviderRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ProviderRegistry<P> {
    pub const fn new() -> Self {
        Self {
            provider: OnceLock::new(),
            init_guard: Mutex::new(()),
        }
    }

    /// The registered provider, if any.
    pub fn get(&self) -> Option<&P> {
        self.provider.get()
    }
}

impl<P: RegisteredProvider> ProviderRegistry<P> {
    /// Return the registered provider, registering one built from `config` first if
    /// the registry is empty.
    ///
    /// # Errors
    /// * `HError::ModuleLoad` if a provider with a different configuration is
    ///   already registered
    /// * any error of `init`, in which case nothing is registered
    pub fn get_or_register<F>(&self, config: ModuleConfig, init: F) -> HResult<&P>
    where
        F: FnOnce(ModuleConfig) -> HResult<P>,
    {
        if let Some(provider) = self.get() {
            return Self::check_matches(provider, &config);
        }
        let _guard = self
            .init_guard
            .lock()
            .map_err(|_| HError::Default("provider registry lock poisoned".to_owned()))?;
        if let Some(provider) = self.get() {
            return Self::check_matches(provider, &config);
        }
        self.register(init(config)?)
    }

    /// Return the registered provider without reading any configuration, or register
    /// one built from the configuration returned by `load_config`.
    pub fn get_or_load<C, F>(&self, load_config: C, init: F) -> HResult<&P>
    where
        C: FnOnce() -> HResult<ModuleConfig>,
        F: FnOnce(ModuleConfig) -> HResult<P>,
    {
        if let Some(provider) = self.get() {
            return Ok(provider);
        }
        let _guard = self
            .init_guard
            .lock()
            .map_err(|_| HError::Default("provider registry lock poisoned".to_owned()))?;
        if let Some(provider) = self.get() {
            return Ok(provider);
        }
        self.register(init(load_config()?)?)
    }

    fn register(&self, provider: P) -> HResult<&P> {
        info!("Registering provider {}", provider.name());
        Ok(self.provider.get_or_init(|| provider))
    }

    fn check_matches<'a>(provider: &'a P, config: &ModuleConfig) -> HResult<&'a P> {
        if provider.config() == config {
            Ok(provider)
        } else {
            Err(HError::ModuleLoad(format!(
                "provider {} is already registered with a different configuration",
                provider.name()
            )))
        }
    }
}

impl ProviderRegistry<Pkcs11Provider> {
    /// Load the PKCS#11 module, once per process.
    ///
    /// * With an explicit `conf` path, the configuration is read and must match the
    ///   registered provider, if there is one.
    /// * Without it, a registered provider is reused as is; otherwise the
    ///   configuration is read from the file named by `env_var`, or `default_path`.
    ///
    /// # Errors
    /// `HError::ModuleLoad` if the configuration is unreadable or invalid, the module
    /// cannot be initialized or conflicts with the registered one.
    pub fn load_module(
        &self,
        conf: Option<PathBuf>,
        env_var: &str,
        default_path: &str,
    ) -> HResult<&Pkcs11Provider> {
        match conf {
            Some(path) => {
                self.get_or_register(read_module_config(&path)?, Pkcs11Provider::instantiate)
            }
            None => self.get_or_load(
                || read_module_config(&ModuleConfig::location(None, env_var, default_path)),
                Pkcs11Provider::instantiate,
            ),
        }
    }
}

/// Read a module configuration, reporting invalid content as a module load failure.
fn read_module_config(path: &Path) -> HResult<ModuleConfig> {
    ModuleConfig::from_file(path).map_err(|e| match e {
        HError::Config(reason) => HError::ModuleLoad(format!(
            "invalid module configuration {}: {reason}",
            path.display()
        )),
        e => e,
    })
}
