//! A PKCS#11 module linked into the test binary.
//!
//! It serves one token from process-wide state, with SoftHSM semantics where the
//! tests depend on them: the user login is shared by all the sessions of the token
//! and ends when its last session closes, and a failed `C_Sign` ends the active
//! signing operation. Tests using it must be `#[serial]`.
#![allow(unsafe_code)]

use std::{
    collections::{HashMap, VecDeque},
    ptr, slice,
    sync::{Mutex, PoisonError},
};

use libloading::Library;
use pkcs11_sys::{
    CK_ATTRIBUTE_PTR, CK_BBOOL, CK_BYTE_PTR, CK_FALSE, CK_FLAGS, CK_INFO, CK_INFO_PTR,
    CK_KEY_TYPE, CK_MECHANISM_PTR, CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_NOTIFY,
    CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE,
    CK_SESSION_HANDLE_PTR, CK_SLOT_ID, CK_SLOT_ID_PTR, CK_TRUE, CK_ULONG, CK_ULONG_PTR,
    CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VERSION, CK_VOID_PTR,
    CKA_ALWAYS_AUTHENTICATE, CKA_CLASS, CKA_KEY_TYPE, CKA_LABEL, CKA_VALUE,
    CKF_SERIAL_SESSION, CKK_EC, CKK_RSA, CKM_ECDSA_SHA256, CKM_SHA256_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS, CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_KEY_HANDLE_INVALID,
    CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID, CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_NOT_LOGGED_IN, CKR_USER_TYPE_INVALID, CKU_CONTEXT_SPECIFIC, CKU_USER,
};

use crate::{ModuleConfig, Pkcs11Provider, hsm_lib::HsmLib};

pub(crate) const SLOT_ID: usize = 7;
pub(crate) const USER_PIN: &str = "1234";
pub(crate) const KEY_PIN: &str = "5678";
/// RSA key with its certificate
pub(crate) const SIGNER: &str = "signer";
/// EC key with its certificate
pub(crate) const EC_SIGNER: &str = "ec-signer";
/// RSA key asking for the key PIN before each signature, with its certificate
pub(crate) const GUARDED: &str = "guarded";
/// RSA key without a certificate
pub(crate) const ORPHAN: &str = "orphan";
pub(crate) const SIGNATURE: &[u8] = b"token signature";

static TOKEN: Mutex<Option<FakeToken>> = Mutex::new(None);

#[derive(Clone)]
pub(crate) struct FakeObject {
    class: CK_OBJECT_CLASS,
    label: String,
    key_type: CK_KEY_TYPE,
    always_authenticate: bool,
    value: Vec<u8>,
}

impl FakeObject {
    fn private_key(label: &str, key_type: CK_KEY_TYPE, always_authenticate: bool) -> Self {
        Self {
            class: CKO_PRIVATE_KEY,
            label: label.to_owned(),
            key_type,
            always_authenticate,
            value: Vec::new(),
        }
    }

    fn certificate(label: &str) -> Self {
        Self {
            class: CKO_CERTIFICATE,
            label: label.to_owned(),
            key_type: 0,
            always_authenticate: false,
            // not parsed by the tests using this module
            value: vec![0x30, 0x03, 0x02, 0x01, 0x01],
        }
    }

    fn attribute(&self, attribute_type: CK_ULONG) -> Option<Vec<u8>> {
        match (attribute_type, self.class) {
            (CKA_CLASS, _) => Some(self.class.to_ne_bytes().to_vec()),
            (CKA_LABEL, _) => Some(self.label.as_bytes().to_vec()),
            (CKA_KEY_TYPE, CKO_PRIVATE_KEY) => Some(self.key_type.to_ne_bytes().to_vec()),
            (CKA_ALWAYS_AUTHENTICATE, CKO_PRIVATE_KEY) => {
                let value: CK_BBOOL = if self.always_authenticate {
                    CK_TRUE
                } else {
                    CK_FALSE
                };
                Some(vec![value])
            }
            (CKA_VALUE, CKO_CERTIFICATE) => Some(self.value.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeSession {
    search: Option<VecDeque<CK_OBJECT_HANDLE>>,
    /// `Some(true)` while a signature waits for the context specific login
    sign: Option<bool>,
}

/// The token served by the module, and what the tests inspect afterwards.
pub(crate) struct FakeToken {
    pub(crate) user_pin: String,
    pub(crate) key_pin: String,
    pub(crate) mechanisms: Vec<CK_MECHANISM_TYPE>,
    pub(crate) objects: Vec<FakeObject>,
    /// Returned by every user login when not `CKR_OK`
    pub(crate) login_rv: CK_RV,
    /// Returned by every `C_SignInit` when not `CKR_OK`
    pub(crate) sign_init_rv: CK_RV,
    pub(crate) logged_in: bool,
    pub(crate) sessions: HashMap<CK_SESSION_HANDLE, FakeSession>,
    pub(crate) next_handle: CK_SESSION_HANDLE,
    pub(crate) closed_sessions: usize,
}

impl Default for FakeToken {
    fn default() -> Self {
        Self {
            user_pin: USER_PIN.to_owned(),
            key_pin: KEY_PIN.to_owned(),
            mechanisms: vec![
                CKM_SHA256_RSA_PKCS,
                CKM_SHA256_RSA_PKCS_PSS,
                CKM_ECDSA_SHA256,
            ],
            objects: vec![
                FakeObject::private_key(SIGNER, CKK_RSA, false),
                FakeObject::certificate(SIGNER),
                FakeObject::private_key(EC_SIGNER, CKK_EC, false),
                FakeObject::certificate(EC_SIGNER),
                FakeObject::private_key(GUARDED, CKK_RSA, true),
                FakeObject::certificate(GUARDED),
                FakeObject::private_key(ORPHAN, CKK_RSA, false),
            ],
            login_rv: CKR_OK,
            sign_init_rv: CKR_OK,
            logged_in: false,
            sessions: HashMap::new(),
            next_handle: 1,
            closed_sessions: 0,
        }
    }
}

impl FakeToken {
    pub(crate) fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn active_signatures(&self) -> usize {
        self.sessions.values().filter(|s| s.sign.is_some()).count()
    }

    fn object(&self, handle: CK_OBJECT_HANDLE) -> Option<&FakeObject> {
        usize::try_from(handle)
            .ok()
            .and_then(|handle| handle.checked_sub(1))
            .and_then(|index| self.objects.get(index))
    }
}

/// Serve `token` and return a provider on the module.
pub(crate) fn provider(token: FakeToken) -> Pkcs11Provider {
    *TOKEN.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    provider_on_served_token()
}

/// Another provider on the module, sharing the token already served.
pub(crate) fn provider_on_served_token() -> Pkcs11Provider {
    let mut config = ModuleConfig::new("/usr/lib/libfake-pkcs11.so");
    config.name = "FakeHSM".to_owned();
    config.slot = Some(SLOT_ID);
    Pkcs11Provider::with_hsm_lib(config, hsm_lib())
}

/// Read the state of the served token.
pub(crate) fn inspect<T>(f: impl FnOnce(&FakeToken) -> T) -> T {
    let token = TOKEN.lock().unwrap_or_else(PoisonError::into_inner);
    f(token.as_ref().expect("no token is served"))
}

pub(crate) fn hsm_lib() -> HsmLib {
    HsmLib {
        _library: current_process(),
        C_Initialize: Some(initialize),
        C_Finalize: Some(finalize),
        C_GetInfo: Some(get_info),
        C_GetSlotList: Some(get_slot_list),
        C_GetMechanismList: Some(get_mechanism_list),
        C_OpenSession: Some(open_session),
        C_CloseSession: Some(close_session),
        C_Login: Some(login),
        C_FindObjectsInit: Some(find_objects_init),
        C_FindObjects: Some(find_objects),
        C_FindObjectsFinal: Some(find_objects_final),
        C_GetAttributeValue: Some(get_attribute_value),
        C_SignInit: Some(sign_init),
        C_Sign: Some(sign),
        C_GenerateRandom: Some(generate_random),
    }
}

#[cfg(unix)]
fn current_process() -> Library {
    libloading::os::unix::Library::this().into()
}

#[cfg(windows)]
fn current_process() -> Library {
    libloading::os::windows::Library::this()
        .expect("handle of the test process")
        .into()
}

fn with_token(f: impl FnOnce(&mut FakeToken) -> CK_RV) -> CK_RV {
    let mut token = TOKEN.lock().unwrap_or_else(PoisonError::into_inner);
    token.as_mut().map_or(CKR_CRYPTOKI_NOT_INITIALIZED, f)
}

fn with_session(
    handle: CK_SESSION_HANDLE,
    f: impl FnOnce(&mut FakeToken, &mut FakeSession) -> CK_RV,
) -> CK_RV {
    with_token(|token| {
        let Some(mut session) = token.sessions.remove(&handle) else {
            return CKR_SESSION_HANDLE_INVALID;
        };
        let rv = f(token, &mut session);
        token.sessions.insert(handle, session);
        rv
    })
}

fn ulong(len: usize) -> CK_ULONG {
    CK_ULONG::try_from(len).unwrap_or(CK_ULONG::MAX)
}

fn len(len: CK_ULONG) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Two-pass output of a list: its length when `out` is null, its items otherwise.
unsafe fn write_list<T: Copy>(items: &[T], out: *mut T, count: CK_ULONG_PTR) -> CK_RV {
    let needed = ulong(items.len());
    unsafe {
        if out.is_null() {
            *count = needed;
            return CKR_OK;
        }
        if *count < needed {
            *count = needed;
            return CKR_BUFFER_TOO_SMALL;
        }
        ptr::copy_nonoverlapping(items.as_ptr(), out, items.len());
        *count = needed;
    }
    CKR_OK
}

unsafe extern "C" fn initialize(_init_args: CK_VOID_PTR) -> CK_RV {
    CKR_OK
}

unsafe extern "C" fn finalize(_reserved: CK_VOID_PTR) -> CK_RV {
    CKR_OK
}

unsafe extern "C" fn get_info(info: CK_INFO_PTR) -> CK_RV {
    fn padded(text: &[u8]) -> [u8; 32] {
        let mut out = [b' '; 32];
        out[..text.len()].copy_from_slice(text);
        out
    }
    let module_info = CK_INFO {
        cryptokiVersion: CK_VERSION {
            major: 2,
            minor: 40,
        },
        manufacturerID: padded(b"Test Token Maker"),
        libraryDescription: padded(b"In-process token"),
        libraryVersion: CK_VERSION { major: 1, minor: 0 },
        ..CK_INFO::default()
    };
    unsafe { info.write(module_info) };
    CKR_OK
}

unsafe extern "C" fn get_slot_list(
    _token_present: CK_BBOOL,
    slot_list: CK_SLOT_ID_PTR,
    count: CK_ULONG_PTR,
) -> CK_RV {
    with_token(|_| unsafe { write_list(&[ulong(SLOT_ID)], slot_list, count) })
}

unsafe extern "C" fn get_mechanism_list(
    slot_id: CK_SLOT_ID,
    mechanisms: CK_MECHANISM_TYPE_PTR,
    count: CK_ULONG_PTR,
) -> CK_RV {
    if slot_id != ulong(SLOT_ID) {
        return CKR_SLOT_ID_INVALID;
    }
    with_token(|token| unsafe { write_list(&token.mechanisms, mechanisms, count) })
}

unsafe extern "C" fn open_session(
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    _application: CK_VOID_PTR,
    _notify: CK_NOTIFY,
    session: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if slot_id != ulong(SLOT_ID) {
        return CKR_SLOT_ID_INVALID;
    }
    if flags & CKF_SERIAL_SESSION == 0 {
        return CKR_SESSION_PARALLEL_NOT_SUPPORTED;
    }
    with_token(|token| {
        let handle = token.next_handle;
        token.next_handle += 1;
        token.sessions.insert(handle, FakeSession::default());
        unsafe { session.write(handle) };
        CKR_OK
    })
}

unsafe extern "C" fn close_session(session: CK_SESSION_HANDLE) -> CK_RV {
    with_token(|token| {
        if token.sessions.remove(&session).is_none() {
            return CKR_SESSION_HANDLE_INVALID;
        }
        token.closed_sessions += 1;
        if token.sessions.is_empty() {
            token.logged_in = false;
        }
        CKR_OK
    })
}

unsafe extern "C" fn login(
    session: CK_SESSION_HANDLE,
    user_type: CK_USER_TYPE,
    pin: CK_UTF8CHAR_PTR,
    pin_len: CK_ULONG,
) -> CK_RV {
    let pin = unsafe { slice::from_raw_parts(pin, len(pin_len)) }.to_vec();
    with_session(session, |token, session| match user_type {
        CKU_USER => {
            if token.login_rv != CKR_OK {
                token.login_rv
            } else if token.logged_in {
                CKR_USER_ALREADY_LOGGED_IN
            } else if pin == token.user_pin.as_bytes() {
                token.logged_in = true;
                CKR_OK
            } else {
                CKR_PIN_INCORRECT
            }
        }
        CKU_CONTEXT_SPECIFIC => match session.sign {
            None => CKR_OPERATION_NOT_INITIALIZED,
            Some(_) if pin == token.key_pin.as_bytes() => {
                session.sign = Some(false);
                CKR_OK
            }
            Some(_) => CKR_PIN_INCORRECT,
        },
        _ => CKR_USER_TYPE_INVALID,
    })
}

unsafe extern "C" fn find_objects_init(
    session: CK_SESSION_HANDLE,
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> CK_RV {
    let template = unsafe { slice::from_raw_parts(template, len(count)) };
    let mut class = None;
    let mut label = None;
    for attribute in template {
        let value = unsafe {
            slice::from_raw_parts(attribute.pValue.cast::<u8>(), len(attribute.ulValueLen))
        };
        match attribute.type_ {
            CKA_CLASS => {
                class = value
                    .try_into()
                    .ok()
                    .map(CK_OBJECT_CLASS::from_ne_bytes);
            }
            CKA_LABEL => label = Some(value.to_vec()),
            _ => {}
        }
    }
    with_session(session, |token, session| {
        if session.search.is_some() {
            return CKR_OPERATION_ACTIVE;
        }
        let found = token
            .objects
            .iter()
            .zip(1..)
            .filter(|(object, _)| token.logged_in || object.class != CKO_PRIVATE_KEY)
            .filter(|(object, _)| class.is_none_or(|class| object.class == class))
            .filter(|(object, _)| {
                label
                    .as_ref()
                    .is_none_or(|label| object.label.as_bytes() == label.as_slice())
            })
            .map(|(_, handle)| handle)
            .collect();
        session.search = Some(found);
        CKR_OK
    })
}

unsafe extern "C" fn find_objects(
    session: CK_SESSION_HANDLE,
    objects: CK_OBJECT_HANDLE_PTR,
    max_count: CK_ULONG,
    count: CK_ULONG_PTR,
) -> CK_RV {
    with_session(session, |_, session| {
        let Some(found) = session.search.as_mut() else {
            return CKR_OPERATION_NOT_INITIALIZED;
        };
        let batch: Vec<CK_OBJECT_HANDLE> = found
            .drain(..found.len().min(len(max_count)))
            .collect();
        unsafe {
            ptr::copy_nonoverlapping(batch.as_ptr(), objects, batch.len());
            count.write(ulong(batch.len()));
        }
        CKR_OK
    })
}

unsafe extern "C" fn find_objects_final(session: CK_SESSION_HANDLE) -> CK_RV {
    with_session(session, |_, session| match session.search.take() {
        Some(_) => CKR_OK,
        None => CKR_OPERATION_NOT_INITIALIZED,
    })
}

unsafe extern "C" fn get_attribute_value(
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> CK_RV {
    let template = unsafe { slice::from_raw_parts_mut(template, len(count)) };
    with_session(session, |token, _| {
        let Some(object) = token.object(object) else {
            return CKR_OBJECT_HANDLE_INVALID;
        };
        let mut rv = CKR_OK;
        for attribute in template.iter_mut() {
            let Some(value) = object.attribute(attribute.type_) else {
                attribute.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                rv = CKR_ATTRIBUTE_TYPE_INVALID;
                continue;
            };
            if attribute.pValue.is_null() {
                attribute.ulValueLen = ulong(value.len());
            } else if len(attribute.ulValueLen) < value.len() {
                attribute.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                rv = CKR_BUFFER_TOO_SMALL;
            } else {
                unsafe {
                    ptr::copy_nonoverlapping(
                        value.as_ptr(),
                        attribute.pValue.cast::<u8>(),
                        value.len(),
                    );
                }
                attribute.ulValueLen = ulong(value.len());
            }
        }
        rv
    })
}

unsafe extern "C" fn sign_init(
    session: CK_SESSION_HANDLE,
    mechanism: CK_MECHANISM_PTR,
    key: CK_OBJECT_HANDLE,
) -> CK_RV {
    let mechanism = unsafe { (*mechanism).mechanism };
    with_session(session, |token, session| {
        if token.sign_init_rv != CKR_OK {
            return token.sign_init_rv;
        }
        if !token.logged_in {
            return CKR_USER_NOT_LOGGED_IN;
        }
        if session.sign.is_some() {
            return CKR_OPERATION_ACTIVE;
        }
        if !token.mechanisms.contains(&mechanism) {
            return CKR_MECHANISM_INVALID;
        }
        match token.object(key) {
            Some(object) if object.class == CKO_PRIVATE_KEY => {
                session.sign = Some(object.always_authenticate);
                CKR_OK
            }
            _ => CKR_KEY_HANDLE_INVALID,
        }
    })
}

unsafe extern "C" fn sign(
    session: CK_SESSION_HANDLE,
    _data: CK_BYTE_PTR,
    _data_len: CK_ULONG,
    signature: CK_BYTE_PTR,
    signature_len: CK_ULONG_PTR,
) -> CK_RV {
    with_session(session, |_, session| {
        match session.sign {
            None => return CKR_OPERATION_NOT_INITIALIZED,
            Some(true) => {
                session.sign = None;
                return CKR_USER_NOT_LOGGED_IN;
            }
            Some(false) => {}
        }
        unsafe {
            if signature.is_null() {
                signature_len.write(ulong(SIGNATURE.len()));
                return CKR_OK;
            }
            if len(*signature_len) < SIGNATURE.len() {
                signature_len.write(ulong(SIGNATURE.len()));
                return CKR_BUFFER_TOO_SMALL;
            }
            ptr::copy_nonoverlapping(SIGNATURE.as_ptr(), signature, SIGNATURE.len());
            signature_len.write(ulong(SIGNATURE.len()));
        }
        session.sign = None;
        CKR_OK
    })
}

unsafe extern "C" fn generate_random(
    session: CK_SESSION_HANDLE,
    random: CK_BYTE_PTR,
    random_len: CK_ULONG,
) -> CK_RV {
    with_session(session, |_, _| {
        let random = unsafe { slice::from_raw_parts_mut(random, len(random_len)) };
        for (byte, value) in random.iter_mut().zip((0_u8..=255).cycle()) {
            *byte = value;
        }
        CKR_OK
    })
}
