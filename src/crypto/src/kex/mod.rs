pub mod kdf;
pub mod x25519;

pub use kdf::{hkdf_expand, SessionKeys};
