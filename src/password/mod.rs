//! Master Password key derivation
//!
//! Derives deterministic per-site passwords from a single master secret
//! using the Master Password scheme: an scrypt-stretched master key, an
//! HMAC-SHA256 site seed, and a fixed table of character templates per
//! password class.
//!
//! The derivation is a pure function: identical inputs produce identical
//! output across processes. The operator uses class [`TemplateClass::Long`]
//! for vCenter credentials; the remaining classes are carried so callers
//! can pick a different shape without touching the derivation itself.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use scrypt::Params;
use sha2::Sha256;

use crate::{Error, Result};

/// Fixed namespace string mixed into both the salt and the site message
const KEY_NAMESPACE: &str = "com.lyndir.masterpassword";

/// scrypt cost parameter, log2 (N = 32768)
const SCRYPT_LOG_N: u8 = 15;
/// scrypt block size
const SCRYPT_R: u32 = 8;
/// scrypt parallelism
const SCRYPT_P: u32 = 2;
/// Length of the stretched master key in bytes
const MASTER_KEY_LEN: usize = 64;

/// Password template class selecting shape and strength
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateClass {
    /// 20 characters, maximum entropy
    Maximum,
    /// 14 characters, pronounceable groups with digit and symbol
    Long,
    /// 8 characters
    Medium,
    /// 4 characters
    Short,
    /// 8 alphanumeric characters
    Basic,
    /// 4 digits
    Pin,
    /// 9 lowercase characters, name-shaped
    Name,
    /// 4 lowercase words
    Phrase,
}

impl TemplateClass {
    /// The template table for this class
    fn templates(self) -> &'static [&'static str] {
        match self {
            TemplateClass::Maximum => &["anoxxxxxxxxxxxxxxxxx", "axxxxxxxxxxxxxxxxxno"],
            TemplateClass::Long => &[
                "CvcvnoCvcvCvcv",
                "CvcvCvcvnoCvcv",
                "CvcvCvcvCvcvno",
                "CvccnoCvcvCvcv",
                "CvccCvcvnoCvcv",
                "CvccCvcvCvcvno",
                "CvcvnoCvccCvcv",
                "CvcvCvccnoCvcv",
                "CvcvCvccCvcvno",
                "CvcvnoCvcvCvcc",
                "CvcvCvcvnoCvcc",
                "CvcvCvcvCvccno",
                "CvccnoCvccCvcv",
                "CvccCvccnoCvcv",
                "CvccCvccCvcvno",
                "CvcvnoCvccCvcc",
                "CvcvCvccnoCvcc",
                "CvcvCvccCvccno",
                "CvccnoCvcvCvcc",
                "CvccCvcvnoCvcc",
                "CvccCvcvCvccno",
            ],
            TemplateClass::Medium => &["CvcnoCvc", "CvcCvcno"],
            TemplateClass::Short => &["Cvcn"],
            TemplateClass::Basic => &["aaanaaan", "aannaaan", "aaannaaa"],
            TemplateClass::Pin => &["nnnn"],
            TemplateClass::Name => &["cvccvcvcv"],
            TemplateClass::Phrase => &[
                "cvcc cvc cvccvcv cvc",
                "cvc cvccvcvcv cvcc",
                "cv cvccv cvc cvcvccv",
            ],
        }
    }

    /// The candidate characters for a single-letter template code
    fn class_chars(code: char) -> Result<&'static str> {
        Ok(match code {
            'V' => "AEIOU",
            'C' => "BCDFGHJKLMNPQRSTVWXYZ",
            'v' => "aeiou",
            'c' => "bcdfghjklmnpqrstvwxyz",
            'A' => "AEIOUBCDFGHJKLMNPQRSTVWXYZ",
            'a' => "AEIOUaeiouBCDFGHJKLMNPQRSTVWXYZbcdfghjklmnpqrstvwxyz",
            'n' => "0123456789",
            'o' => "@&%?,=[]_:-+*$#!'^~;()/.",
            'x' => "AEIOUaeiouBCDFGHJKLMNPQRSTVWXYZbcdfghjklmnpqrstvwxyz0123456789!@#$%^&*()",
            ' ' => " ",
            _ => return Err(Error::kdf(format!("unknown template code {:?}", code))),
        })
    }
}

impl FromStr for TemplateClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "maximum" | "max" => TemplateClass::Maximum,
            "long" => TemplateClass::Long,
            "medium" => TemplateClass::Medium,
            "short" => TemplateClass::Short,
            "basic" => TemplateClass::Basic,
            "pin" => TemplateClass::Pin,
            "name" => TemplateClass::Name,
            "phrase" => TemplateClass::Phrase,
            other => return Err(Error::kdf(format!("unknown template class {:?}", other))),
        })
    }
}

impl fmt::Display for TemplateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateClass::Maximum => "maximum",
            TemplateClass::Long => "long",
            TemplateClass::Medium => "medium",
            TemplateClass::Short => "short",
            TemplateClass::Basic => "basic",
            TemplateClass::Pin => "pin",
            TemplateClass::Name => "name",
            TemplateClass::Phrase => "phrase",
        };
        f.write_str(name)
    }
}

/// The scrypt-stretched master key for one (user, master password) pair
///
/// Deriving the key is the expensive step (scrypt with N = 32768), so the
/// orchestrator computes it once and reuses it for every site until the
/// user name or master password changes.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Stretch a master password into a master key for the given user
    ///
    /// The salt binds the key to the user name: the namespace string, the
    /// 32-bit big-endian length of the user name, and the user name bytes.
    pub fn new(user_name: &str, master_password: &str) -> Result<Self> {
        let mut salt = Vec::with_capacity(KEY_NAMESPACE.len() + 4 + user_name.len());
        salt.extend_from_slice(KEY_NAMESPACE.as_bytes());
        salt.extend_from_slice(&(user_name.len() as u32).to_be_bytes());
        salt.extend_from_slice(user_name.as_bytes());

        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, MASTER_KEY_LEN)
            .map_err(|e| Error::kdf(format!("invalid scrypt parameters: {}", e)))?;

        let mut key = [0u8; MASTER_KEY_LEN];
        scrypt::scrypt(master_password.as_bytes(), &salt, &params, &mut key)
            .map_err(|e| Error::kdf(format!("scrypt failed: {}", e)))?;

        Ok(Self { key })
    }

    /// Derive the password for one site
    ///
    /// The per-site seed is HMAC-SHA256 over the namespace string, the
    /// 32-bit big-endian length of the site name, the site name bytes, and
    /// the 32-bit big-endian counter. The first seed byte selects the
    /// template, each following byte selects one character.
    pub fn site_password(
        &self,
        site_name: &str,
        counter: u32,
        class: TemplateClass,
    ) -> Result<String> {
        let mut message = Vec::with_capacity(KEY_NAMESPACE.len() + 8 + site_name.len());
        message.extend_from_slice(KEY_NAMESPACE.as_bytes());
        message.extend_from_slice(&(site_name.len() as u32).to_be_bytes());
        message.extend_from_slice(site_name.as_bytes());
        message.extend_from_slice(&counter.to_be_bytes());

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| Error::kdf(format!("hmac init failed: {}", e)))?;
        mac.update(&message);
        let seed = mac.finalize().into_bytes();

        let templates = class.templates();
        let template = templates[seed[0] as usize % templates.len()];

        let mut password = String::with_capacity(template.len());
        for (i, code) in template.chars().enumerate() {
            let chars = TemplateClass::class_chars(code)?;
            let bytes = chars.as_bytes();
            let pick = bytes[seed[i + 1] as usize % bytes.len()];
            password.push(pick as char);
        }

        Ok(password)
    }
}

/// Derive a site password in one step, without caching the master key
///
/// Used by the template helpers when a user name override makes the cached
/// master key inapplicable (the scrypt salt includes the user name).
pub fn derive_site_password(
    user_name: &str,
    master_password: &str,
    site_name: &str,
    counter: u32,
    class: TemplateClass,
) -> Result<String> {
    MasterKey::new(user_name, master_password)?.site_password(site_name, counter, class)
}

/// Derive the vCenter login password for a host
///
/// Class `long`, counter 1, with `/` stripped: the character can appear in
/// the symbol class but is rejected by downstream config file formats.
pub fn vcenter_password(key: &MasterKey, host: &str) -> Result<String> {
    Ok(key
        .site_password(host, 1, TemplateClass::Long)?
        .replace('/', ""))
}
