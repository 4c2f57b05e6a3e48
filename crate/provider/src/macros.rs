/// Call a PKCS#11 function of an [`HsmLib`](crate::hsm_lib::HsmLib) and return its raw `CK_RV`.
///
/// Returns early with an error when the module does not export the function.
macro_rules! hsm_rv {
    ($hsm:expr, $func:ident $(, $arg:expr)* $(,)?) => {{
        let func = $hsm.$func.ok_or_else(|| {
            $crate::HError::Default(format!(
                "{} not available on library",
                stringify!($func)
            ))
        })?;
        #[allow(unsafe_code)]
        let rv = unsafe { func($($arg),*) };
        rv
    }};
}

/// Call a PKCS#11 function and return early with [`HError::Pkcs11`](crate::HError::Pkcs11)
/// unless it returns `CKR_OK`.
macro_rules! hsm_call {
    ($hsm:expr, $msg:expr, $func:ident $(, $arg:expr)* $(,)?) => {{
        let rv = hsm_rv!($hsm, $func $(, $arg)*);
        if rv != pkcs11_sys::CKR_OK {
            return Err($crate::HError::Pkcs11 {
                context: $msg.to_string(),
                rv,
            });
        }
    }};
}
