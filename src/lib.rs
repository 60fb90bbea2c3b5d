pub mod diag;
pub mod error;
pub mod format;
pub mod keyslot;
pub mod pki;
pub mod session;
pub mod storage;
pub mod utils;
