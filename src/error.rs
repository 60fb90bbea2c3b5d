use crate::pki::KeyName;
use snafu::Snafu;
use snafu::{Backtrace, GenerateImplicitData};
use std::io;
use std::path::{Path, PathBuf};
use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{}: {}", path.display(), error))]
    Io {
        error: io::Error,
        path: PathBuf,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Internal IO Error (please submit a bug report with the backtrace): {}",
        error
    ))]
    IoInternal {
        error: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing the INI file: {}", error))]
    Ini {
        error: ini::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Key derivation error: {}", error))]
    Crypto { error: String, backtrace: Backtrace },
    #[snafu(display("Invalid keyblob {}: {}.", id, error))]
    MacError {
        error: digest::MacError,
        id: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing key {}. Make sure your keyfile is complete", key_name))]
    MissingKey {
        key_name: KeyName,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid HFS0: {}.", error))]
    InvalidHfs0 {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "HFS0 header hash mismatch (expected {}, got {})",
        expected,
        actual
    ))]
    HashMismatch {
        expected: String,
        actual: String,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Range {:#x}+{:#x} is out of bounds of a storage of size {:#x}",
        offset,
        size,
        storage_size
    ))]
    OutOfRange {
        offset: u64,
        size: u64,
        storage_size: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("No file named {} in partition", name))]
    MissingFile { name: String, backtrace: Backtrace },
    #[snafu(display("Refusing to extract {:?}: not a plain file name", name))]
    UnsafeFileName { name: String, backtrace: Backtrace },
    #[snafu(display("The {} partition is missing or didn't mount", name))]
    PartitionNotMounted { name: String, backtrace: Backtrace },
    #[snafu(display("{} is not a known key", key_name))]
    UnknownKeySlot {
        key_name: KeyName,
        backtrace: Backtrace,
    },
    #[snafu(display("{} is {} bytes long, got {}", key_name, expected, actual))]
    KeyLength {
        key_name: KeyName,
        expected: usize,
        actual: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert filename to UTF8: {}.", filename))]
    Utf8Conversion {
        filename: String,
        error: Utf8Error,
        backtrace: Backtrace,
    },
}

impl Error {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Error {
        if let Error::IoInternal { error, backtrace } = self {
            Error::Io {
                error,
                path: path.as_ref().to_owned(),
                backtrace,
            }
        } else {
            self
        }
    }

    pub(crate) fn invalid_hfs0(error: &'static str) -> Error {
        Error::InvalidHfs0 {
            error,
            backtrace: Backtrace::generate(),
        }
    }

    pub(crate) fn key_length(key_name: KeyName, expected: usize, actual: usize) -> Error {
        Error::KeyLength {
            key_name,
            expected,
            actual,
            backtrace: Backtrace::generate(),
        }
    }

    pub(crate) fn missing_key(key_name: KeyName) -> Error {
        Error::MissingKey {
            key_name,
            backtrace: Backtrace::generate(),
        }
    }
}

pub trait ResultExt {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn with_path<U: AsRef<Path>>(self, path: U) -> Result<T, Error> {
        self.map_err(|err| err.with_path(path))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoInternal {
            error: err,
            backtrace: Backtrace::generate(),
        }
    }
}

impl<T: AsRef<Path>> From<(io::Error, T)> for Error {
    fn from((error, path): (io::Error, T)) -> Error {
        Error::Io {
            error,
            path: path.as_ref().to_owned(),
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<ini::Error> for Error {
    fn from(error: ini::Error) -> Error {
        Error::Ini {
            error,
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Error {
        Error::Utf8Conversion {
            filename: String::from_utf8_lossy(error.as_bytes()).into_owned(),
            error: error.utf8_error(),
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<(usize, digest::MacError)> for Error {
    fn from((id, error): (usize, digest::MacError)) -> Error {
        Error::MacError {
            error,
            id,
            backtrace: Backtrace::generate(),
        }
    }
}
