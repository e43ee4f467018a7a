//! Key bin persistence for one adapter

use std::path::{Path, PathBuf};

use rawbt_core::smp::{BtSecurityLevel, PairingData, PairingMode, SmpKeyBin, SmpKeyType};
use rawbt_core::{BdAddressAndType, KeyStoreConfig};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    dir: Option<PathBuf>,
}

impl KeyStore {
    pub fn new(config: &KeyStoreConfig) -> Self {
        Self {
            dir: config.key_dir.clone(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Stored bin for `addr`, corrupt files are deleted and yield `None`
    pub fn load(&self, addr: &BdAddressAndType) -> Option<SmpKeyBin> {
        let dir = self.dir.as_deref()?;
        match SmpKeyBin::read(dir, addr) {
            Ok(bin) => bin,
            Err(e) => {
                warn!("key store: {}", e);
                None
            }
        }
    }

    /// Persist a completed pairing, returns whether a file was written
    pub fn store(&self, addr: &BdAddressAndType, pd: &PairingData) -> bool {
        let dir = match self.dir.as_deref() {
            Some(dir) => dir,
            None => return false,
        };
        let bin = SmpKeyBin::create(*addr, pd);
        if !bin.is_valid() {
            debug!("key store: nothing valid to persist for {}", addr);
            return false;
        }
        match bin.write(dir, true) {
            Ok(written) => written,
            Err(e) => {
                warn!("key store: {}", e);
                false
            }
        }
    }

    pub fn remove(&self, addr: &BdAddressAndType) -> bool {
        let dir = match self.dir.as_deref() {
            Some(dir) => dir,
            None => return false,
        };
        match SmpKeyBin::remove(dir, addr) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("key store: {}", e);
                false
            }
        }
    }
}

/// Seed `pd` from a stored bin so the next connection re-encrypts instead of pairing
pub fn seed_pairing_data(bin: &SmpKeyBin, pd: &mut PairingData) {
    pd.clear_keys();
    pd.keys_init_has = bin.keys_init;
    pd.keys_resp_has = bin.keys_resp;
    if bin.keys_init.contains(SmpKeyType::ENC_KEY) {
        pd.ltk_init = bin.ltk_init;
    }
    if bin.keys_resp.contains(SmpKeyType::ENC_KEY) {
        pd.ltk_resp = bin.ltk_resp;
    }
    pd.csrk_init = bin.csrk_init;
    pd.csrk_resp = bin.csrk_resp;
    pd.lk_init = bin.lk_init;
    pd.lk_resp = bin.lk_resp;
    pd.sec_level_user = BtSecurityLevel::EncOnly;
    pd.io_cap_user = bin.io_cap;
    pd.mode = PairingMode::PrePaired;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::smp::{LtkProperties, SmpIoCapability, SmpLongTermKey, SmpPairingState};
    use rawbt_core::{BdAddress, BdAddressType};

    fn addr() -> BdAddressAndType {
        BdAddressAndType::new(
            BdAddress::new([1, 2, 3, 4, 5, 6]),
            BdAddressType::BdAddrLePublic,
        )
    }

    fn paired() -> PairingData {
        PairingData {
            state: SmpPairingState::Completed,
            sec_level_conn: BtSecurityLevel::EncAuth,
            io_cap_conn: SmpIoCapability::KeyboardDisplay,
            keys_resp_has: SmpKeyType::ENC_KEY,
            ltk_resp: SmpLongTermKey {
                properties: LtkProperties::RESPONDER | LtkProperties::AUTH,
                enc_size: 16,
                ediv: 0x4242,
                rand: 99,
                ltk: [7; 16],
            },
            ..PairingData::default()
        }
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = KeyStore::default();
        assert!(!store.is_enabled());
        assert!(!store.store(&addr(), &paired()));
        assert!(store.load(&addr()).is_none());
        assert!(!store.remove(&addr()));
    }

    #[test]
    fn store_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(&KeyStoreConfig {
            key_dir: Some(dir.path().to_path_buf()),
        });
        assert!(store.store(&addr(), &paired()));
        let bin = store.load(&addr()).expect("stored");
        assert_eq!(bin.ltk_resp, paired().ltk_resp);

        let mut pd = PairingData::default();
        seed_pairing_data(&bin, &mut pd);
        assert_eq!(pd.mode, PairingMode::PrePaired);
        assert_eq!(pd.sec_level_user, BtSecurityLevel::EncOnly);
        assert_eq!(pd.encryption_ltk(), Some(paired().ltk_resp));

        assert!(store.remove(&addr()));
        assert!(!store.remove(&addr()));
    }

    #[test]
    fn incomplete_pairing_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(&KeyStoreConfig {
            key_dir: Some(dir.path().to_path_buf()),
        });
        let pd = PairingData {
            state: SmpPairingState::KeyDistribution,
            ..paired()
        };
        assert!(!store.store(&addr(), &pd));
    }
}
