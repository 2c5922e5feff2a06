// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! Error type shared by every module of the provider

use std::error;
use std::fmt;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

type Origin = Box<dyn error::Error + Send + Sync>;

/// An error with its [ErrorKind], a message and an optional cause
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    origin: Option<Origin>,
    errmsg: Option<String>,
}

/// Broad classification of provider errors
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad security level, hash family, missing fallback, bad library
    Configuration,
    /// A session could not be opened (or logged in) within the retries
    DeviceOpen,
    /// No device or software object matches the identifier
    ObjectNotFound,
    /// Empty or malformed key, digest or signature
    InvalidArgument,
    /// Neither the device path nor the fallback handles the request
    Unsupported,
    /// Any other failure reported by the device gateway
    Device,
    /// Other error, see origin
    Nested,
}

impl Error {
    fn new(kind: ErrorKind, errmsg: Option<String>) -> Error {
        Error {
            kind: kind,
            origin: None,
            errmsg: errmsg,
        }
    }

    /// A [ErrorKind::Configuration] error
    pub fn config(errmsg: String) -> Error {
        Error::new(ErrorKind::Configuration, Some(errmsg))
    }

    /// A [ErrorKind::Device] error
    pub fn device(errmsg: String) -> Error {
        Error::new(ErrorKind::Device, Some(errmsg))
    }

    /// A [ErrorKind::ObjectNotFound] error
    pub fn not_found(errmsg: String) -> Error {
        Error::new(ErrorKind::ObjectNotFound, Some(errmsg))
    }

    /// A [ErrorKind::InvalidArgument] error
    pub fn invalid_argument(errmsg: String) -> Error {
        Error::new(ErrorKind::InvalidArgument, Some(errmsg))
    }

    /// A [ErrorKind::Unsupported] error
    pub fn unsupported(errmsg: String) -> Error {
        Error::new(ErrorKind::Unsupported, Some(errmsg))
    }

    /// Wraps a foreign error, recording `errmsg` as the failing operation
    pub fn with_origin<E>(kind: ErrorKind, errmsg: String, error: E) -> Error
    where
        E: Into<Origin>,
    {
        Error {
            kind: kind,
            origin: Some(error.into()),
            errmsg: Some(errmsg),
        }
    }

    /// Wraps a foreign error with no message of its own
    pub fn other_error<E>(error: E) -> Error
    where
        E: Into<Origin>,
    {
        Error {
            kind: ErrorKind::Nested,
            origin: Some(error.into()),
            errmsg: None,
        }
    }

    /// Prefixes the error with `errmsg`, keeping the original kind
    pub fn context(self, errmsg: String) -> Error {
        let kind = self.kind;
        Error::with_origin(kind, errmsg, self)
    }

    /// The kind of the error
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True for [ErrorKind::ObjectNotFound]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::ObjectNotFound
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration error"),
            ErrorKind::DeviceOpen => write!(f, "device open error"),
            ErrorKind::ObjectNotFound => write!(f, "object not found"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::Unsupported => write!(f, "unsupported operation"),
            ErrorKind::Device => write!(f, "device error"),
            ErrorKind::Nested => write!(f, "error"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.errmsg, &self.origin) {
            (Some(msg), Some(origin)) => write!(f, "{}: {}", msg, origin),
            (Some(msg), None) => write!(f, "{}", msg),
            (None, Some(origin)) => origin.fmt(f),
            (None, None) => self.kind.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.origin {
            Some(e) => Some(e.as_ref()),
            None => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Error {
        Error::other_error(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Error {
        Error::with_origin(
            ErrorKind::Configuration,
            "failed to parse configuration".to_string(),
            error,
        )
    }
}

impl From<asn1::ParseError> for Error {
    fn from(error: asn1::ParseError) -> Error {
        Error::invalid_argument(format!("asn1 parse error: {}", error))
    }
}

impl From<asn1::WriteError> for Error {
    fn from(_: asn1::WriteError) -> Error {
        Error::device("asn1 encoding failed".to_string())
    }
}

impl From<cryptoki::error::Error> for Error {
    fn from(error: cryptoki::error::Error) -> Error {
        Error::with_origin(ErrorKind::Device, "pkcs11".to_string(), error)
    }
}
