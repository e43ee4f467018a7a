//! Security Manager Protocol data types

pub mod crypto;
pub mod keybin;
pub mod keys;
pub mod pairing;
pub mod pdu;
pub mod types;

pub use crypto::{SmpAddress, SmpCrypto};
pub use keybin::SmpKeyBin;
pub use keys::{
    CsrkProperties, LtkProperties, SmpIdentityResolvingKey, SmpLinkKey, SmpLongTermKey,
    SmpSignatureResolvingKey,
};
pub use pairing::PairingData;
pub use pdu::{PairingFeatures, SmpPdu};
pub use types::{
    BtSecurityLevel, PairingMode, SmpAuthReqs, SmpIoCapability, SmpKeyType, SmpPairingState,
    SmpReason,
};
