//! Small shared helpers: hex rendering for error messages and `ensure`.

pub mod ensure;
pub mod hex;
