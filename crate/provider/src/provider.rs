use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    fs,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};

use pkcs11_sys::CK_INFO;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    HError, HResult, ModuleConfig, Session, SignatureAlgorithm, Slot, SlotSelection,
    hsm_lib::HsmLib, registry::RegisteredProvider, slots::get_available_slot_list,
};

struct ProviderInner {
    name: String,
    config: ModuleConfig,
    hsm_lib: Arc<HsmLib>,
    slots: Mutex<HashMap<usize, Arc<Slot>>>,
}

/// A loaded and initialized PKCS#11 module.
///
/// Cloning is cheap and yields a handle on the same module. The module is finalized
/// when the last clone and the last session opened through it are dropped.
#[derive(Clone)]
pub struct Pkcs11Provider {
    inner: Arc<ProviderInner>,
}

impl Pkcs11Provider {
    /// Load and initialize the module described by `config`.
    ///
    /// # Errors
    /// `HError::ModuleLoad` if the library is unreadable or fails to initialize.
    pub fn instantiate(config: ModuleConfig) -> HResult<Self> {
        fs::metadata(&config.library).map_err(|e| {
            HError::ModuleLoad(format!(
                "cannot access the PKCS#11 library {}: {e}",
                config.library.display()
            ))
        })?;
        let hsm_lib = HsmLib::instantiate(&config.library)?;
        Ok(Self::with_hsm_lib(config, hsm_lib))
    }

    pub(crate) fn with_hsm_lib(config: ModuleConfig, hsm_lib: HsmLib) -> Self {
        let provider = Self {
            inner: Arc::new(ProviderInner {
                name: config.provider_name(),
                config,
                hsm_lib: Arc::new(hsm_lib),
                slots: Mutex::new(HashMap::new()),
            }),
        };
        match provider.get_info() {
            Ok(module_info) => info!("Loaded {}: {module_info}", provider.name()),
            Err(e) => debug!("C_GetInfo failed on {}: {e}", provider.name()),
        }
        provider
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.inner.config
    }

    pub fn get_info(&self) -> HResult<Info> {
        let mut info = CK_INFO::default();
        hsm_call!(
            self.inner.hsm_lib,
            "Failed getting the module info",
            C_GetInfo,
            &raw mut info
        );
        Ok(info.into())
    }

    /// The ids of the slots that have a token present.
    pub fn get_available_slot_list(&self) -> HResult<Vec<usize>> {
        get_available_slot_list(&self.inner.hsm_lib)
    }

    /// The slot designated by the module configuration.
    ///
    /// # Errors
    /// `HError::SlotIndexNotFound` if the configured slot list index is past the slots
    /// with a token present.
    pub fn default_slot_id(&self) -> HResult<usize> {
        match self.config().slot_selection() {
            SlotSelection::Id(slot_id) => Ok(slot_id),
            SlotSelection::ListIndex(index) => self
                .get_available_slot_list()?
                .get(index)
                .copied()
                .ok_or(HError::SlotIndexNotFound(index)),
        }
    }

    /// Get the slot manager of `slot_id`, creating it on first use.
    ///
    /// # Errors
    /// `HError::SlotNotFound` if no slot with a token has this id.
    pub fn get_slot(&self, slot_id: usize) -> HResult<Arc<Slot>> {
        let mut slots = self
            .inner
            .slots
            .lock()
            .map_err(|_| HError::Default("Failed to acquire lock on slots".to_owned()))?;
        if let Some(slot) = slots.get(&slot_id) {
            return Ok(slot.clone());
        }
        if !self.get_available_slot_list()?.contains(&slot_id) {
            return Err(HError::SlotNotFound(slot_id));
        }
        let slot = Arc::new(Slot::new(self.inner.hsm_lib.clone(), slot_id));
        slots.insert(slot_id, slot.clone());
        Ok(slot)
    }

    /// Open a session on `slot_id`. Pair it with [`Session::close`] or let it drop.
    pub fn open_session(&self, slot_id: usize) -> HResult<Session> {
        self.get_slot(slot_id)?.open_session()
    }

    /// The subset of the supported signature algorithms advertised by the token.
    pub fn get_supported_signature_algorithms(
        &self,
        slot_id: usize,
    ) -> HResult<Vec<SignatureAlgorithm>> {
        self.get_slot(slot_id)?.get_supported_signature_algorithms()
    }

    /// Run `operation` in a fresh logged in session which is closed afterwards,
    /// whatever the outcome.
    ///
    /// An error of `operation` takes precedence over an error closing the session.
    pub fn with_session<T, F>(&self, slot_id: usize, token_pin: &str, operation: F) -> HResult<T>
    where
        F: FnOnce(&Session) -> HResult<T>,
    {
        let mut session = self.open_session(slot_id)?;
        let result = match session.login(token_pin) {
            Ok(()) => operation(&session),
            Err(e) => Err(e),
        };
        let closed = session.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Same as [`Self::with_session`] with a deadline.
    ///
    /// PKCS#11 calls cannot be cancelled: the operation runs on a worker thread and is
    /// abandoned after `timeout`. Its session is still closed when the worker finishes.
    ///
    /// # Errors
    /// `HError::Timeout` if the operation did not complete in time.
    pub fn with_session_timeout<T, F>(
        &self,
        slot_id: usize,
        token_pin: &str,
        timeout: Duration,
        operation: F,
    ) -> HResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> HResult<T> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let provider = self.clone();
        let token_pin = Zeroizing::new(token_pin.to_owned());
        thread::Builder::new()
            .name(format!("{}-slot-{slot_id}", self.name()))
            .spawn(move || {
                let result = provider.with_session(slot_id, &token_pin, operation);
                // the receiver is gone when the caller gave up
                drop(sender.send(result));
            })
            .map_err(|e| HError::Default(format!("cannot spawn the session worker: {e}")))?;
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(HError::Timeout(format!(
                "no response from slot {slot_id} after {timeout:?}"
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(HError::Default(
                "the session worker terminated without a result".to_owned(),
            )),
        }
    }
}

impl RegisteredProvider for Pkcs11Provider {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn config(&self) -> &ModuleConfig {
        Self::config(self)
    }
}

/// General information about a module (`C_GetInfo`).
#[derive(Debug, Clone)]
pub struct Info {
    pub cryptoki_version: (u8, u8),
    pub manufacturer_id: String,
    pub flags: u64,
    pub library_description: String,
    pub library_version: (u8, u8),
}

/// PKCS#11 strings are padded with blanks, not NUL terminated.
fn padded_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_owned()
}

impl From<CK_INFO> for Info {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer_id: padded_string(&info.manufacturerID),
            flags: u64::from(info.flags),
            library_description: padded_string(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}, Manufacturer ID: {}, Flags: {}, Library Description: \
             {}, Library Version: {}.{}",
            self.cryptoki_version.0,
            self.cryptoki_version.1,
            self.manufacturer_id,
            self.flags,
            self.library_description,
            self.library_version.0,
            self.library_version.1
        )
    }
}
