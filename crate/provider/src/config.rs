use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::debug;

use crate::{HError, HResult};

/// Name given to a module configuration that does not set one.
pub const DEFAULT_MODULE_NAME: &str = "SoftHSM";

/// Prefix of the name under which a provider is registered.
pub const PROVIDER_NAME_PREFIX: &str = "PKCS11-";

/// Environment variable naming the module configuration file.
pub const HSM_CONF_ENV: &str = "HSM_CONF";

/// Module configuration used when `HSM_CONF` is not set.
pub const DEFAULT_CONF_PATH: &str = "/etc/softhsm/pkcs11.cfg";

/// Configuration of a PKCS#11 module.
///
/// Read either from TOML
///
/// ```toml
/// name = "SoftHSM"
/// library = "/usr/lib/softhsm/libsofthsm2.so"
/// slot_list_index = 0
/// ```
///
/// or from the `key = value` syntax of SunPKCS11 configuration files
/// (`name`, `library`, `slot`, `slotListIndex`, `description`).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Path of the PKCS#11 shared library
    pub library: PathBuf,
    /// Explicit slot id
    pub slot: Option<usize>,
    /// Index into the list of slots with a token present
    pub slot_list_index: Option<usize>,
    pub description: Option<String>,
}

fn default_name() -> String {
    DEFAULT_MODULE_NAME.to_owned()
}

/// How the token slot is chosen once the module is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSelection {
    Id(usize),
    ListIndex(usize),
}

impl ModuleConfig {
    /// Build a configuration for a library path with default settings.
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            name: default_name(),
            library: library.into(),
            slot: None,
            slot_list_index: None,
            description: None,
        }
    }

    /// The name the provider built from this configuration is registered under.
    #[must_use]
    pub fn provider_name(&self) -> String {
        format!("{PROVIDER_NAME_PREFIX}{}", self.name)
    }

    pub const fn slot_selection(&self) -> SlotSelection {
        match (self.slot, self.slot_list_index) {
            (Some(id), _) => SlotSelection::Id(id),
            (None, Some(index)) => SlotSelection::ListIndex(index),
            (None, None) => SlotSelection::ListIndex(0),
        }
    }

    /// Resolve the configuration file to use.
    ///
    /// An explicit `conf` wins, then the file named by the `env_var` environment
    /// variable, then `default_path`.
    pub fn location(conf: Option<PathBuf>, env_var: &str, default_path: &str) -> PathBuf {
        if let Some(conf) = conf {
            return conf;
        }
        match env::var_os(env_var) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                debug!("{env_var} is not set, using the default configuration {default_path}");
                PathBuf::from(default_path)
            }
        }
    }

    /// Load the configuration from `conf`, the file named by `HSM_CONF`, or the
    /// default configuration, in that order.
    pub fn load(conf: Option<PathBuf>) -> HResult<Self> {
        Self::from_file(&Self::location(conf, HSM_CONF_ENV, DEFAULT_CONF_PATH))
    }

    /// Load the configuration from a file.
    ///
    /// # Errors
    /// `HError::ModuleLoad` if the file cannot be read, `HError::Config` if its
    /// content is neither valid TOML nor a valid SunPKCS11 configuration.
    pub fn from_file(path: &Path) -> HResult<Self> {
        debug!("Loading module configuration from: {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            HError::ModuleLoad(format!(
                "cannot read the module configuration {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from its TOML or SunPKCS11 text.
    ///
    /// # Errors
    /// `HError::Config` on invalid content.
    pub fn parse(content: &str) -> HResult<Self> {
        let config = match toml::from_str::<Self>(content) {
            Ok(config) => config,
            Err(toml_error) => Self::parse_legacy(content).map_err(|legacy_error| {
                HError::Config(format!(
                    "not a TOML configuration ({}) nor a SunPKCS11 configuration ({legacy_error})",
                    toml_error.message()
                ))
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    fn parse_legacy(content: &str) -> HResult<Self> {
        let mut name = None;
        let mut library = None;
        let mut slot = None;
        let mut slot_list_index = None;
        let mut description = None;
        let mut block_depth = 0_usize;

        for (number, raw_line) in content.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            // attribute templates span `{ ... }` blocks and are not used here
            if block_depth > 0 {
                block_depth += line.matches('{').count();
                block_depth = block_depth.saturating_sub(line.matches('}').count());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(HError::Config(format!(
                    "line {}: expected `key = value`",
                    number + 1
                )));
            };
            let key = key.trim();
            let value = value.trim();
            if value.starts_with('{') {
                block_depth = value
                    .matches('{')
                    .count()
                    .saturating_sub(value.matches('}').count());
                continue;
            }
            let value = value.trim_matches('"').to_owned();
            match key {
                "name" => name = Some(value),
                "library" => library = Some(PathBuf::from(value)),
                "slot" => slot = Some(parse_index(key, &value)?),
                "slotListIndex" => slot_list_index = Some(parse_index(key, &value)?),
                "description" => description = Some(value),
                other => debug!("ignoring SunPKCS11 configuration key {other}"),
            }
        }

        Ok(Self {
            name: name.unwrap_or_else(default_name),
            library: library
                .ok_or_else(|| HError::Config("missing `library` entry".to_owned()))?,
            slot,
            slot_list_index,
            description,
        })
    }

    fn validate(&self) -> HResult<()> {
        if self.name.trim().is_empty() {
            return Err(HError::Config("the module name is empty".to_owned()));
        }
        if self.library.as_os_str().is_empty() {
            return Err(HError::Config("the library path is empty".to_owned()));
        }
        if self.slot.is_some() && self.slot_list_index.is_some() {
            return Err(HError::Config(
                "`slot` and `slot_list_index` cannot both be set".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_index(key: &str, value: &str) -> HResult<usize> {
    value
        .parse()
        .map_err(|e| HError::Config(format!("invalid `{key}` value {value:?}: {e}")))
}
