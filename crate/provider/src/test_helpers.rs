//! Environment of the end-to-end tests.
//!
//! The tests need a token provisioned with a key pair and its certificate. Without
//! the variables describing it, the scenarios are skipped rather than failed.

use std::{env, path::PathBuf};

use tracing::warn;
use zeroize::Zeroizing;

use crate::HSM_CONF_ENV;

pub const HSM_KEY_ALIAS_ENV: &str = "HSM_KEY_ALIAS";
pub const HSM_KEY_PASS_ENV: &str = "HSM_KEY_PASS";
pub const HSM_TOKEN_PASS_ENV: &str = "HSM_TOKEN_PASS";
pub const HSM_SLOT_ID_ENV: &str = "HSM_SLOT_ID";

/// Per-token configuration of the shared scenarios.
#[derive(Debug)]
pub struct HsmTestConfig {
    /// Module configuration file
    pub conf_path: PathBuf,
    /// Label of the private key and of its certificate
    pub key_alias: String,
    pub key_pass: Zeroizing<String>,
    pub token_pass: Zeroizing<String>,
    /// Overrides the slot of the module configuration
    pub slot_id: Option<usize>,
}

#[derive(Debug)]
pub enum HsmTestEnvironment {
    Ready(HsmTestConfig),
    Skipped { missing: Vec<&'static str> },
}

impl HsmTestEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the environment from `lookup`, which returns the value of a variable.
    ///
    /// The PINs may be empty but must be set. An unparsable `HSM_SLOT_ID` is ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let conf = lookup(HSM_CONF_ENV).filter(|v| !v.is_empty());
        let key_alias = lookup(HSM_KEY_ALIAS_ENV).filter(|v| !v.is_empty());
        let key_pass = lookup(HSM_KEY_PASS_ENV);
        let token_pass = lookup(HSM_TOKEN_PASS_ENV);

        match (conf, key_alias, key_pass, token_pass) {
            (Some(conf), Some(key_alias), Some(key_pass), Some(token_pass)) => {
                let slot_id = lookup(HSM_SLOT_ID_ENV).and_then(|v| match v.trim().parse::<usize>() {
                    Ok(slot_id) => Some(slot_id),
                    Err(e) => {
                        warn!("ignoring {HSM_SLOT_ID_ENV}={v}: {e}");
                        None
                    }
                });
                Self::Ready(HsmTestConfig {
                    conf_path: PathBuf::from(conf),
                    key_alias,
                    key_pass: Zeroizing::new(key_pass),
                    token_pass: Zeroizing::new(token_pass),
                    slot_id,
                })
            }
            (conf, key_alias, key_pass, token_pass) => {
                let missing = [
                    (HSM_CONF_ENV, conf.is_none()),
                    (HSM_KEY_ALIAS_ENV, key_alias.is_none()),
                    (HSM_KEY_PASS_ENV, key_pass.is_none()),
                    (HSM_TOKEN_PASS_ENV, token_pass.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, is_missing)| is_missing.then_some(name))
                .collect();
                Self::Skipped { missing }
            }
        }
    }

    /// The configuration if the environment is complete.
    ///
    /// Otherwise reports the skip on stderr, which the test harness shows next to the
    /// test name, and in the logs.
    pub fn into_config(self) -> Option<HsmTestConfig> {
        match self {
            Self::Ready(config) => Some(config),
            Self::Skipped { missing } => {
                let missing = missing.join(", ");
                eprintln!("SKIPPED: HSM scenario, missing environment: {missing}");
                warn!("HSM scenario skipped, missing environment: {missing}");
                None
            }
        }
    }
}
