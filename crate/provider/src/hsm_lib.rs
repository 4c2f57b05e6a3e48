use std::{path::Path, ptr};

use libloading::Library;
use pkcs11_sys::{
    CK_C_CloseSession, CK_C_Finalize, CK_C_FindObjects, CK_C_FindObjectsFinal,
    CK_C_FindObjectsInit, CK_C_GenerateRandom, CK_C_GetAttributeValue, CK_C_GetInfo,
    CK_C_GetMechanismList, CK_C_GetSlotList, CK_C_INITIALIZE_ARGS, CK_C_Initialize, CK_C_Login,
    CK_C_OpenSession, CK_C_Sign, CK_C_SignInit, CKF_OS_LOCKING_OK,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_OK,
};
use tracing::{debug, warn};

use crate::{HError, HResult};

/// The PKCS#11 entry points of a dynamically loaded module.
///
/// Only the functions needed for session management, object lookup and signing are
/// resolved. The library is initialized with OS locking on load and finalized when
/// the struct is dropped, so it must outlive every session opened through it: sessions
/// hold it behind an `Arc`.
pub struct HsmLib {
    pub(crate) _library: Library,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,

    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetMechanismList: CK_C_GetMechanismList,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,

    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,
    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,

    pub(crate) C_SignInit: CK_C_SignInit,
    pub(crate) C_Sign: CK_C_Sign,

    pub(crate) C_GenerateRandom: CK_C_GenerateRandom,
}

impl HsmLib {
    /// Load the module at `path`, resolve its entry points and call `C_Initialize`.
    ///
    /// # Errors
    /// `HError::ModuleLoad` if the file cannot be opened as a shared library, a symbol is
    /// missing or the module refuses to initialize.
    pub(crate) fn instantiate(path: &Path) -> HResult<Self> {
        debug!("Loading PKCS#11 module {}", path.display());
        #[allow(unsafe_code)]
        let hsm_lib = unsafe {
            let library = Library::new(path)?;
            HsmLib {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetMechanismList: Some(*library.get(b"C_GetMechanismList")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_SignInit: Some(*library.get(b"C_SignInit")?),
                C_Sign: Some(*library.get(b"C_Sign")?),
                C_GenerateRandom: Some(*library.get(b"C_GenerateRandom")?),
                // we need to keep the library alive
                _library: library,
            }
        };
        hsm_lib.initialize()?;
        Ok(hsm_lib)
    }

    fn initialize(&self) -> HResult<()> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let rv = hsm_rv!(
            self,
            C_Initialize,
            (&raw mut init_args).cast::<std::ffi::c_void>()
        );
        match rv {
            CKR_OK => Ok(()),
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                warn!("the PKCS#11 module was already initialized by this process");
                Ok(())
            }
            rv => Err(HError::ModuleLoad(format!(
                "C_Initialize failed with return code {rv:#x}"
            ))),
        }
    }

    fn finalize(&self) -> HResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the PKCS#11 module",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("{e}");
        }
    }
}
