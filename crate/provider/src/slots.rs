use std::{
    ptr,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use openssl::{memcmp, sha::sha256};
use pkcs11_sys::{CK_MECHANISM_TYPE, CK_SLOT_ID, CK_ULONG};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{HError, HResult, Session, SignatureAlgorithm, hsm_lib::HsmLib};

/// A token slot of a loaded module.
///
/// Slots are handed out by [`Pkcs11Provider::get_slot`](crate::Pkcs11Provider::get_slot)
/// after checking that a token is present, and cache the mechanism list of the token
/// so that signing does not query it on every call.
///
/// The user login is held by the token for all the sessions of the process: the slot
/// keeps a SHA-256 digest of the PIN that opened it, so that a session joining that
/// login can be checked against the same PIN.
pub struct Slot {
    hsm_lib: Arc<HsmLib>,
    slot_id: usize,
    mechanisms: OnceLock<Vec<CK_MECHANISM_TYPE>>,
    user_login: Mutex<Option<Zeroizing<[u8; 32]>>>,
}

impl Slot {
    pub(crate) const fn new(hsm_lib: Arc<HsmLib>, slot_id: usize) -> Self {
        Self {
            hsm_lib,
            slot_id,
            mechanisms: OnceLock::new(),
            user_login: Mutex::new(None),
        }
    }

    pub const fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub(crate) fn hsm_lib(&self) -> &Arc<HsmLib> {
        &self.hsm_lib
    }

    pub(crate) fn ck_slot_id(&self) -> HResult<CK_SLOT_ID> {
        Ok(CK_SLOT_ID::try_from(self.slot_id)?)
    }

    /// Open a new read-only session on this slot.
    ///
    /// The session is closed when dropped; call [`Session::close`] to observe
    /// closing errors.
    pub fn open_session(self: &Arc<Self>) -> HResult<Session> {
        Session::open(self.clone())
    }

    /// List the mechanisms the token in this slot advertises.
    pub fn get_supported_mechanisms(&self) -> HResult<Vec<CK_MECHANISM_TYPE>> {
        if let Some(mechanisms) = self.mechanisms.get() {
            return Ok(mechanisms.clone());
        }
        let mechanisms = self.query_mechanisms()?;
        debug!(
            "Slot {} advertises {} mechanisms",
            self.slot_id,
            mechanisms.len()
        );
        // a concurrent caller may have filled the cache with the same list
        Ok(self.mechanisms.get_or_init(|| mechanisms).clone())
    }

    /// The signature algorithms whose mechanism the token advertises.
    pub fn get_supported_signature_algorithms(&self) -> HResult<Vec<SignatureAlgorithm>> {
        Ok(SignatureAlgorithm::supported_by(
            &self.get_supported_mechanisms()?,
        ))
    }

    /// Remember `pin` as the PIN of the user login the token accepted.
    pub(crate) fn record_user_login(&self, pin: &str) -> HResult<()> {
        *self.lock_user_login()? = Some(Zeroizing::new(sha256(pin.as_bytes())));
        Ok(())
    }

    /// Whether `pin` is the PIN of the recorded user login.
    ///
    /// `false` when no login was recorded: the token was then logged in outside of
    /// this slot manager and the PIN cannot be checked.
    pub(crate) fn is_user_login_pin(&self, pin: &str) -> HResult<bool> {
        let digest = Zeroizing::new(sha256(pin.as_bytes()));
        Ok(self
            .lock_user_login()?
            .as_ref()
            .is_some_and(|recorded| memcmp::eq(recorded.as_slice(), digest.as_slice())))
    }

    fn lock_user_login(&self) -> HResult<MutexGuard<'_, Option<Zeroizing<[u8; 32]>>>> {
        self.user_login
            .lock()
            .map_err(|_| HError::Default("Failed to acquire lock on the user login".to_owned()))
    }

    fn query_mechanisms(&self) -> HResult<Vec<CK_MECHANISM_TYPE>> {
        let slot_id = self.ck_slot_id()?;
        let mut count: CK_ULONG = 0;
        hsm_call!(
            self.hsm_lib,
            "Failed counting the mechanisms",
            C_GetMechanismList,
            slot_id,
            ptr::null_mut(),
            &raw mut count
        );
        let mut mechanisms: Vec<CK_MECHANISM_TYPE> = vec![0; usize::try_from(count)?];
        hsm_call!(
            self.hsm_lib,
            "Failed listing the mechanisms",
            C_GetMechanismList,
            slot_id,
            mechanisms.as_mut_ptr(),
            &raw mut count
        );
        mechanisms.truncate(usize::try_from(count)?);
        Ok(mechanisms)
    }
}

/// List the ids of the slots that have a token present.
pub(crate) fn get_available_slot_list(hsm_lib: &HsmLib) -> HResult<Vec<usize>> {
    let mut count: CK_ULONG = 0;
    hsm_call!(
        hsm_lib,
        "Failed counting the slots",
        C_GetSlotList,
        pkcs11_sys::CK_TRUE,
        ptr::null_mut(),
        &raw mut count
    );
    let mut slots: Vec<CK_SLOT_ID> = vec![0; usize::try_from(count)?];
    hsm_call!(
        hsm_lib,
        "Failed listing the slots",
        C_GetSlotList,
        pkcs11_sys::CK_TRUE,
        slots.as_mut_ptr(),
        &raw mut count
    );
    slots.truncate(usize::try_from(count)?);
    slots
        .into_iter()
        .map(|id| usize::try_from(id).map_err(HError::from))
        .collect()
}
