//! Encrypted storage of exchange API secrets
//!
//! Secrets are sealed with a passphrase before they reach the database and are
//! only opened in memory when the execution queue needs to place an order.

mod encryption;

pub use encryption::{decrypt_secret, encrypt_secret, EncryptedSecret};
