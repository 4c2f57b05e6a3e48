use std::{fmt, str::FromStr};

use openssl::hash::MessageDigest;
use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_RSA_PKCS_MGF_TYPE, CKG_MGF1_SHA256, CKG_MGF1_SHA384, CKG_MGF1_SHA512,
    CKM_ECDSA_SHA256, CKM_ECDSA_SHA384, CKM_ECDSA_SHA512, CKM_SHA256, CKM_SHA256_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS, CKM_SHA384, CKM_SHA384_RSA_PKCS, CKM_SHA384_RSA_PKCS_PSS, CKM_SHA512,
    CKM_SHA512_RSA_PKCS, CKM_SHA512_RSA_PKCS_PSS,
};

use crate::HError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub(crate) const fn mechanism(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::Sha256 => CKM_SHA256,
            Self::Sha384 => CKM_SHA384,
            Self::Sha512 => CKM_SHA512,
        }
    }

    pub(crate) const fn mgf(self) -> CK_RSA_PKCS_MGF_TYPE {
        match self {
            Self::Sha256 => CKG_MGF1_SHA256,
            Self::Sha384 => CKG_MGF1_SHA384,
            Self::Sha512 => CKG_MGF1_SHA512,
        }
    }

    pub(crate) fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Signature scheme of an algorithm, independent of its digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5
    RsaPkcs1,
    /// RSASSA-PSS with MGF1 over the same digest and a salt as long as the digest
    RsaPss,
    Ecdsa,
}

/// The signature algorithms a provider can offer.
///
/// Names follow the Java Cryptography Architecture standard names
/// (`SHA256withRSA`, `SHA384withRSASSA-PSS`, `SHA512withECDSA`...), which is what
/// [`FromStr`] and [`fmt::Display`] accept and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    Sha256WithRsaPss,
    Sha384WithRsaPss,
    Sha512WithRsaPss,
    Sha256WithEcdsa,
    Sha384WithEcdsa,
    Sha512WithEcdsa,
}

impl SignatureAlgorithm {
    pub const ALL: [Self; 9] = [
        Self::Sha256WithRsa,
        Self::Sha384WithRsa,
        Self::Sha512WithRsa,
        Self::Sha256WithRsaPss,
        Self::Sha384WithRsaPss,
        Self::Sha512WithRsaPss,
        Self::Sha256WithEcdsa,
        Self::Sha384WithEcdsa,
        Self::Sha512WithEcdsa,
    ];

    pub const fn hash(self) -> HashAlgorithm {
        match self {
            Self::Sha256WithRsa | Self::Sha256WithRsaPss | Self::Sha256WithEcdsa => {
                HashAlgorithm::Sha256
            }
            Self::Sha384WithRsa | Self::Sha384WithRsaPss | Self::Sha384WithEcdsa => {
                HashAlgorithm::Sha384
            }
            Self::Sha512WithRsa | Self::Sha512WithRsaPss | Self::Sha512WithEcdsa => {
                HashAlgorithm::Sha512
            }
        }
    }

    pub const fn scheme(self) -> SignatureScheme {
        match self {
            Self::Sha256WithRsa | Self::Sha384WithRsa | Self::Sha512WithRsa => {
                SignatureScheme::RsaPkcs1
            }
            Self::Sha256WithRsaPss | Self::Sha384WithRsaPss | Self::Sha512WithRsaPss => {
                SignatureScheme::RsaPss
            }
            Self::Sha256WithEcdsa | Self::Sha384WithEcdsa | Self::Sha512WithEcdsa => {
                SignatureScheme::Ecdsa
            }
        }
    }

    /// The PKCS#11 mechanism performing digest and signature in one operation.
    pub const fn mechanism(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::Sha256WithRsa => CKM_SHA256_RSA_PKCS,
            Self::Sha384WithRsa => CKM_SHA384_RSA_PKCS,
            Self::Sha512WithRsa => CKM_SHA512_RSA_PKCS,
            Self::Sha256WithRsaPss => CKM_SHA256_RSA_PKCS_PSS,
            Self::Sha384WithRsaPss => CKM_SHA384_RSA_PKCS_PSS,
            Self::Sha512WithRsaPss => CKM_SHA512_RSA_PKCS_PSS,
            Self::Sha256WithEcdsa => CKM_ECDSA_SHA256,
            Self::Sha384WithEcdsa => CKM_ECDSA_SHA384,
            Self::Sha512WithEcdsa => CKM_ECDSA_SHA512,
        }
    }

    pub fn from_mechanism(mechanism: CK_MECHANISM_TYPE) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.mechanism() == mechanism)
    }

    /// Keep the algorithms whose mechanism appears in `mechanisms`, in canonical order.
    pub fn supported_by(mechanisms: &[CK_MECHANISM_TYPE]) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|a| mechanisms.contains(&a.mechanism()))
            .collect()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256WithRsa => "SHA256withRSA",
            Self::Sha384WithRsa => "SHA384withRSA",
            Self::Sha512WithRsa => "SHA512withRSA",
            Self::Sha256WithRsaPss => "SHA256withRSASSA-PSS",
            Self::Sha384WithRsaPss => "SHA384withRSASSA-PSS",
            Self::Sha512WithRsaPss => "SHA512withRSASSA-PSS",
            Self::Sha256WithEcdsa => "SHA256withECDSA",
            Self::Sha384WithEcdsa => "SHA384withECDSA",
            Self::Sha512WithEcdsa => "SHA512withECDSA",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = HError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| HError::Default(format!("unknown signature algorithm: {s}")))
    }
}
