//! PKCS#11 session lifecycle.
//!
//! A [`Session`] is bound to one [`Slot`] and moves through
//! [`SessionState::Open`] -> [`SessionState::LoggedIn`] -> [`SessionState::Closed`].
//! Closing is idempotent and also happens on drop, so a session is released on
//! every exit path, including errors and panics in the code using it.
//!
//! Object handles found through a session borrow it (see
//! [`Session::find_key_and_certificate`]), so the compiler rejects any use of a handle
//! after its session was closed.

use std::{cell::Cell, fmt, marker::PhantomData, ptr, sync::Arc};

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_TRUE,
    CK_ULONG, CK_USER_TYPE, CKF_SERIAL_SESSION, CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK, CKR_PIN_EXPIRED, CKR_PIN_INCORRECT, CKR_PIN_INVALID,
    CKR_PIN_LEN_RANGE, CKR_PIN_LOCKED, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_PIN_NOT_INITIALIZED, CKU_USER,
};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::{HError, HResult, Slot, hsm_lib::HsmLib};

/// Number of handles fetched per `C_FindObjects` call
const FIND_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    LoggedIn,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::LoggedIn => "logged in",
        })
    }
}

/// A read-only PKCS#11 session on a token.
///
/// The session is `Send` but not `Sync`: it may move to another thread but is never
/// shared between concurrent callers, since modules do not guarantee that a single
/// session is safe to use from several threads.
pub struct Session {
    slot: Arc<Slot>,
    handle: CK_SESSION_HANDLE,
    state: SessionState,
    _not_sync: PhantomData<Cell<()>>,
}

impl Session {
    pub(crate) fn open(slot: Arc<Slot>) -> HResult<Self> {
        let slot_id = slot.ck_slot_id()?;
        let mut handle: CK_SESSION_HANDLE = 0;
        let rv = hsm_rv!(
            slot.hsm_lib(),
            C_OpenSession,
            slot_id,
            CKF_SERIAL_SESSION,
            ptr::null_mut(),
            None,
            &raw mut handle
        );
        match rv {
            CKR_OK => {}
            CKR_SLOT_ID_INVALID | CKR_TOKEN_NOT_PRESENT => {
                return Err(HError::SlotNotFound(slot.slot_id()));
            }
            rv => {
                return Err(HError::Pkcs11 {
                    context: format!("Failed opening a session on slot {}", slot.slot_id()),
                    rv,
                });
            }
        }
        debug!("Opened session {handle} on slot {}", slot.slot_id());
        Ok(Self {
            slot,
            handle,
            state: SessionState::Open,
            _not_sync: PhantomData,
        })
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub fn slot_id(&self) -> usize {
        self.slot.slot_id()
    }

    pub(crate) fn slot(&self) -> &Slot {
        &self.slot
    }

    pub(crate) fn hsm(&self) -> &HsmLib {
        self.slot.hsm_lib()
    }

    pub(crate) const fn session_handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    /// Log the normal user into the token with `token_pin` (which may be empty).
    ///
    /// If another session of this process already logged the user in, the token
    /// reports `CKR_USER_ALREADY_LOGGED_IN` and this session shares that login,
    /// provided `token_pin` is the PIN that login was made with.
    ///
    /// # Errors
    /// * `HError::AlreadyLoggedIn` if this session is already logged in
    /// * `HError::Authentication` if the token rejects the PIN, or holds a login made
    ///   with another PIN or outside of this provider
    /// * `HError::SessionState` if the session is closed
    pub fn login(&mut self, token_pin: &str) -> HResult<()> {
        match self.state {
            SessionState::Closed => {
                return Err(HError::SessionState(
                    "cannot log into a closed session".to_owned(),
                ));
            }
            SessionState::LoggedIn => {
                return Err(HError::AlreadyLoggedIn(u64::from(self.handle)));
            }
            SessionState::Open => {}
        }
        let rv = self.call_login(CKU_USER, token_pin)?;
        match rv {
            CKR_OK => self.slot.record_user_login(token_pin)?,
            CKR_USER_ALREADY_LOGGED_IN => {
                // the token does not check the PIN of a login it already holds
                if !self.slot.is_user_login_pin(token_pin)? {
                    return Err(HError::Authentication(format!(
                        "slot {} is logged in with another PIN or by another provider",
                        self.slot_id()
                    )));
                }
                debug!(
                    "user already logged into the token of slot {}, sharing the login",
                    self.slot_id()
                );
            }
            rv => return Err(login_error(rv)),
        }
        debug!("Session {} logged in", self.handle);
        self.state = SessionState::LoggedIn;
        Ok(())
    }

    /// Call `C_Login` for `user_type` and return the raw return code.
    pub(crate) fn call_login(&self, user_type: CK_USER_TYPE, pin: &str) -> HResult<CK_RV> {
        let mut pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
        let rv = hsm_rv!(
            self.hsm(),
            C_Login,
            self.handle,
            user_type,
            pin_bytes.as_mut_ptr(),
            CK_ULONG::try_from(pin_bytes.len())?
        );
        Ok(rv)
    }

    /// Close the session. Calling it again is a no-op.
    ///
    /// There is no explicit `C_Logout`: the token returns to the public state when its
    /// last session closes, and logging out here would also log out the other sessions
    /// of the process.
    pub fn close(&mut self) -> HResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        debug!("Closing session {}", self.handle);
        hsm_call!(
            self.hsm(),
            format!("Failed closing session {}", self.handle),
            C_CloseSession,
            self.handle
        );
        Ok(())
    }

    pub(crate) fn require_logged_in(&self) -> HResult<()> {
        if self.state == SessionState::LoggedIn {
            Ok(())
        } else {
            Err(HError::SessionState(format!(
                "session {} is {}, a login is required",
                self.handle, self.state
            )))
        }
    }

    /// Generate `len` random bytes with the token RNG.
    pub fn generate_random(&self, len: usize) -> HResult<Vec<u8>> {
        if self.state == SessionState::Closed {
            return Err(HError::SessionState("the session is closed".to_owned()));
        }
        let mut values = vec![0_u8; len];
        hsm_call!(
            self.hsm(),
            "Failed generating random data",
            C_GenerateRandom,
            self.handle,
            values.as_mut_ptr(),
            CK_ULONG::try_from(len)?
        );
        Ok(values)
    }

    /// Retrieve the handles of the objects matching `template`.
    ///
    /// The search is always finalized, even when fetching a batch fails.
    pub(crate) fn find_object_handles(
        &self,
        template: &mut [CK_ATTRIBUTE],
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        hsm_call!(
            self.hsm(),
            "Failed to initialize object search",
            C_FindObjectsInit,
            self.handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        let found = self.fetch_object_handles();
        hsm_call!(
            self.hsm(),
            "Failed to finalize object search",
            C_FindObjectsFinal,
            self.handle
        );
        found
    }

    fn fetch_object_handles(&self) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let mut object_handles = Vec::new();
        let mut batch = [CK_OBJECT_HANDLE::default(); FIND_BATCH_SIZE];
        loop {
            let mut object_count: CK_ULONG = 0;
            hsm_call!(
                self.hsm(),
                "Failed to find objects",
                C_FindObjects,
                self.handle,
                batch.as_mut_ptr(),
                CK_ULONG::try_from(FIND_BATCH_SIZE)?,
                &raw mut object_count
            );
            let count = usize::try_from(object_count)?;
            if count == 0 {
                break;
            }
            trace!("Found {count} objects");
            object_handles.extend_from_slice(batch.get(..count).ok_or_else(|| {
                HError::Default("More objects returned than requested".to_owned())
            })?);
        }
        Ok(object_handles)
    }

    /// Fill `template` from the object attributes.
    ///
    /// Returns `None` when an attribute does not exist on the object or may not be
    /// revealed.
    fn call_get_attributes(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        template: &mut [CK_ATTRIBUTE],
    ) -> HResult<Option<()>> {
        let rv = hsm_rv!(
            self.hsm(),
            C_GetAttributeValue,
            self.handle,
            object_handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        match rv {
            CKR_OK => Ok(Some(())),
            CKR_ATTRIBUTE_TYPE_INVALID | CKR_ATTRIBUTE_SENSITIVE => Ok(None),
            rv => Err(HError::Pkcs11 {
                context: format!("Failed to get the attributes of object {object_handle}"),
                rv,
            }),
        }
    }

    /// Read a variable length attribute.
    pub(crate) fn get_attribute_bytes(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> HResult<Option<Vec<u8>>> {
        let mut template = [CK_ATTRIBUTE {
            type_: attribute_type,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        }];
        if self
            .call_get_attributes(object_handle, &mut template)?
            .is_none()
        {
            return Ok(None);
        }
        let value_len = template[0].ulValueLen;
        // CK_UNAVAILABLE_INFORMATION
        if value_len == CK_ULONG::MAX {
            return Ok(None);
        }
        let mut value = vec![0_u8; usize::try_from(value_len)?];
        let mut template = [CK_ATTRIBUTE {
            type_: attribute_type,
            pValue: value.as_mut_ptr().cast::<std::ffi::c_void>(),
            ulValueLen: value_len,
        }];
        if self
            .call_get_attributes(object_handle, &mut template)?
            .is_none()
        {
            return Ok(None);
        }
        value.truncate(usize::try_from(template[0].ulValueLen)?);
        Ok(Some(value))
    }

    pub(crate) fn get_ulong_attribute(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> HResult<Option<CK_ULONG>> {
        let mut value: CK_ULONG = 0;
        let mut template = [CK_ATTRIBUTE {
            type_: attribute_type,
            pValue: (&raw mut value).cast::<std::ffi::c_void>(),
            ulValueLen: CK_ULONG::try_from(size_of::<CK_ULONG>())?,
        }];
        Ok(self
            .call_get_attributes(object_handle, &mut template)?
            .map(|()| value))
    }

    pub(crate) fn get_bool_attribute(
        &self,
        object_handle: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> HResult<Option<bool>> {
        let mut value: CK_BBOOL = 0;
        let mut template = [CK_ATTRIBUTE {
            type_: attribute_type,
            pValue: (&raw mut value).cast::<std::ffi::c_void>(),
            ulValueLen: CK_ULONG::try_from(size_of::<CK_BBOOL>())?,
        }];
        Ok(self
            .call_get_attributes(object_handle, &mut template)?
            .map(|()| value == CK_TRUE))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{e}");
        }
    }
}

pub(crate) fn login_error(rv: CK_RV) -> HError {
    let reason = match rv {
        CKR_PIN_INCORRECT => "incorrect PIN",
        CKR_PIN_INVALID | CKR_PIN_LEN_RANGE => "invalid PIN",
        CKR_PIN_LOCKED => "PIN locked",
        CKR_PIN_EXPIRED => "PIN expired",
        CKR_USER_PIN_NOT_INITIALIZED => "user PIN not initialized",
        rv => {
            return HError::Pkcs11 {
                context: "Failed logging in".to_owned(),
                rv,
            };
        }
    };
    HError::Authentication(reason.to_owned())
}
