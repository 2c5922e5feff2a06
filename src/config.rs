// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! Provider options, loaded from a TOML file or built in code, and the
//! discovery of the PKCS#11 library through environment variables

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use toml;

/// Default capacity of the idle session pool
pub const DEFAULT_SESSION_CACHE_SIZE: i64 = 10;
/// Default number of retries when opening a session fails
pub const DEFAULT_CREATE_SESSION_RETRIES: u32 = 10;
/// Default delay between two session open attempts
pub const DEFAULT_CREATE_SESSION_RETRY_DELAY: Duration =
    Duration::from_millis(100);

const DEFAULT_PIN: &str = "98765432";
const DEFAULT_LABEL: &str = "P11CSP";

/* Well known locations of SoftHSM, checked when PKCS11_LIB is unset */
const DEFAULT_LIBRARY_PATHS: [&str; 4] = [
    "/usr/lib/softhsm/libsofthsm2.so",
    "/usr/lib/x86_64-linux-gnu/softhsm/libsofthsm2.so",
    "/usr/local/lib/softhsm/libsofthsm2.so",
    "/usr/lib/libsofthsm2.so",
];

/// Name of the configuration file looked up by [Opts::find_conf]
pub const DEFAULT_CONF_NAME: &str = "p11csp.toml";

/// Hash families accepted for the software fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFamily {
    /// SHA-256 and SHA-384
    Sha2,
    /// SHA3-256 and SHA3-384
    Sha3,
}

impl FromStr for HashFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<HashFamily> {
        match s {
            "SHA2" => Ok(HashFamily::Sha2),
            "SHA3" => Ok(HashFamily::Sha3),
            _ => Err(Error::config(format!("Hash Family not supported [{}]", s))),
        }
    }
}

impl fmt::Display for HashFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HashFamily::Sha2 => write!(f, "SHA2"),
            HashFamily::Sha3 => write!(f, "SHA3"),
        }
    }
}

/// Options consumed by [crate::Provider::new]
///
/// The numeric session options are optional; when unset the defaults
/// above apply. A `session_cache_size` lower or equal to zero disables
/// session pooling entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opts {
    /// Path of the PKCS#11 module
    pub library: String,
    /// Label of the token holding the keys
    pub label: String,
    /// User PIN of the token
    pub pin: String,
    /// Hash family of the fallback, "SHA2" or "SHA3"
    #[serde(default = "default_hash")]
    pub hash: String,
    /// Security level in bits, selects the curve of new keys
    #[serde(default = "default_security")]
    pub security: usize,
    /// Verify signatures in software instead of on the token
    #[serde(default)]
    pub software_verify: bool,
    /// Mark generated key objects as not modifiable
    #[serde(default)]
    pub immutable: bool,
    /// Capacity of the idle session pool
    pub session_cache_size: Option<i64>,
    /// Retries after a failed session open
    pub create_session_retries: Option<u32>,
    /// Delay in milliseconds
    pub create_session_retry_delay: Option<u64>,
}

fn default_hash() -> String {
    "SHA2".to_string()
}

fn default_security() -> usize {
    256
}

impl Default for Opts {
    fn default() -> Opts {
        Opts {
            library: String::new(),
            label: String::new(),
            pin: String::new(),
            hash: default_hash(),
            security: default_security(),
            software_verify: false,
            immutable: false,
            session_cache_size: None,
            create_session_retries: None,
            create_session_retry_delay: None,
        }
    }
}

impl Opts {
    /// Builds options from the environment, see [find_pkcs11_lib]
    pub fn from_env() -> Opts {
        let (library, pin, label) = find_pkcs11_lib();
        Opts {
            library: library,
            label: label,
            pin: pin,
            ..Default::default()
        }
    }

    /// Parses a TOML configuration file
    pub fn from_file(filename: &str) -> Result<Opts> {
        let config_str = fs::read_to_string(filename)?;
        let opts: Opts = toml::from_str(&config_str)?;
        Ok(opts)
    }

    /// Locates the configuration file
    ///
    /// P11CSP_CONF has the highest precedence, then the XDG config
    /// directory, then $HOME/.config.
    pub fn find_conf() -> Result<String> {
        if let Ok(var) = env::var("P11CSP_CONF") {
            return Ok(var);
        }
        let datafile = match env::var("XDG_CONFIG_HOME") {
            Ok(xdg) => format!("{}/p11csp/{}", xdg, DEFAULT_CONF_NAME),
            Err(_) => match env::var("HOME") {
                Ok(home) => {
                    format!("{}/.config/p11csp/{}", home, DEFAULT_CONF_NAME)
                }
                Err(_) => {
                    return Err(Error::config(
                        "no configuration directory available".to_string(),
                    ))
                }
            },
        };
        if Path::new(&datafile).is_file() {
            Ok(datafile)
        } else {
            Err(Error::config(format!(
                "configuration file not found [{}]",
                datafile
            )))
        }
    }

    /// Parsed hash family, fails on unknown names
    pub fn hash_family(&self) -> Result<HashFamily> {
        HashFamily::from_str(&self.hash)
    }

    /// Pool capacity, with the default applied
    pub fn session_cache_size(&self) -> i64 {
        self.session_cache_size.unwrap_or(DEFAULT_SESSION_CACHE_SIZE)
    }

    /// Open retries, with the default applied
    pub fn create_session_retries(&self) -> u32 {
        self.create_session_retries
            .unwrap_or(DEFAULT_CREATE_SESSION_RETRIES)
    }

    /// Delay between open attempts, with the default applied
    pub fn create_session_retry_delay(&self) -> Duration {
        match self.create_session_retry_delay {
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_CREATE_SESSION_RETRY_DELAY,
        }
    }
}

/// Returns the (library, pin, label) triple to use for the device
///
/// Each value is sourced from PKCS11_LIB, PKCS11_PIN and PKCS11_LABEL
/// respectively. When PKCS11_LIB is not set the first existing well
/// known SoftHSM location is returned, or an empty string if none exists.
pub fn find_pkcs11_lib() -> (String, String, String) {
    let library = match env::var("PKCS11_LIB") {
        Ok(lib) => lib,
        Err(_) => DEFAULT_LIBRARY_PATHS
            .iter()
            .find(|p| Path::new(p).is_file())
            .map(|p| p.to_string())
            .unwrap_or_default(),
    };
    let pin = env::var("PKCS11_PIN").unwrap_or(DEFAULT_PIN.to_string());
    let label = env::var("PKCS11_LABEL").unwrap_or(DEFAULT_LABEL.to_string());
    (library, pin, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_toml() {
        let opts: Opts = toml::from_str(
            r#"
library = "/usr/lib/softhsm/libsofthsm2.so"
label = "test"
pin = "1234"
security = 384
session_cache_size = -1
create_session_retry_delay = 5
"#,
        )
        .unwrap();
        assert_eq!(opts.security, 384);
        assert_eq!(opts.hash, "SHA2");
        assert_eq!(opts.software_verify, false);
        assert_eq!(opts.session_cache_size(), -1);
        assert_eq!(
            opts.create_session_retries(),
            DEFAULT_CREATE_SESSION_RETRIES
        );
        assert_eq!(
            opts.create_session_retry_delay(),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn test_defaults() {
        let opts = Opts::default();
        assert_eq!(opts.session_cache_size(), DEFAULT_SESSION_CACHE_SIZE);
        assert_eq!(
            opts.create_session_retry_delay(),
            DEFAULT_CREATE_SESSION_RETRY_DELAY
        );
        assert_eq!(opts.hash_family().unwrap(), HashFamily::Sha2);
    }

    #[test]
    fn test_bad_hash_family() {
        let opts = Opts {
            hash: "SHA8".to_string(),
            ..Default::default()
        };
        let err = opts.hash_family().unwrap_err();
        assert_eq!(err.to_string(), "Hash Family not supported [SHA8]");
    }

    #[test]
    #[serial]
    fn test_find_pkcs11_lib_env() {
        let saved: Vec<(&str, Option<String>)> =
            ["PKCS11_LIB", "PKCS11_PIN", "PKCS11_LABEL"]
                .iter()
                .map(|v| (*v, env::var(v).ok()))
                .collect();

        env::set_var("PKCS11_LIB", "/usr/lib/pkcs11");
        env::set_var("PKCS11_PIN", "23456789");
        env::set_var("PKCS11_LABEL", "testing");
        let (lib, pin, label) = find_pkcs11_lib();
        assert_eq!(lib, "/usr/lib/pkcs11");
        assert_eq!(pin, "23456789");
        assert_eq!(label, "testing");

        env::remove_var("PKCS11_LIB");
        env::remove_var("PKCS11_PIN");
        env::remove_var("PKCS11_LABEL");
        let (_, pin, label) = find_pkcs11_lib();
        assert_eq!(pin, DEFAULT_PIN);
        assert_eq!(label, DEFAULT_LABEL);

        for (var, val) in saved {
            match val {
                Some(v) => env::set_var(var, v),
                None => env::remove_var(var),
            }
        }
    }

    #[test]
    #[serial]
    fn test_find_conf_env() {
        let saved = env::var("P11CSP_CONF").ok();
        env::set_var("P11CSP_CONF", "/tmp/some.toml");
        assert_eq!(Opts::find_conf().unwrap(), "/tmp/some.toml");
        match saved {
            Some(v) => env::set_var("P11CSP_CONF", v),
            None => env::remove_var("P11CSP_CONF"),
        }
    }
}
