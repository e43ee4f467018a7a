//! Security Manager: pairing engine, watchdog and key persistence

mod engine;
mod keystore;
pub(crate) mod watchdog;

pub use engine::{SmpAction, SmpActions, SmpSession, SmpSessionParams};
pub use keystore::{seed_pairing_data, KeyStore};
