pub mod hfs0;
pub mod xci;
