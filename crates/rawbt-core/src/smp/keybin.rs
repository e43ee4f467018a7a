//! Persisted pairing keys
//!
//! A key bin is a fixed-layout little-endian record:
//!
//! ```text
//! version:u16 size:u16 ts_creation_sec:u64 address:6 address_type:u8
//! sec_level:u8 io_cap:u8 keys_init:u8 keys_resp:u8
//! [ltk_init:28] [ltk_resp:28] [csrk_init:17] [csrk_resp:17] [lk_init:19] [lk_resp:19]
//! ```
//!
//! Optional key structures are present only when the matching bit is set in
//! the role's key mask, so `size` must equal the size recomputed from the masks.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{KeyStoreError, PacketError};
use crate::protocol::packet::Reader;
use crate::smp::keys::{SmpLinkKey, SmpLongTermKey, SmpSignatureResolvingKey};
use crate::smp::pairing::PairingData;
use crate::smp::types::{BtSecurityLevel, SmpIoCapability, SmpKeyType, SmpPairingState};
use crate::types::{unix_seconds, BdAddress, BdAddressAndType, BdAddressType};

/// Current layout version tag
pub const KEYBIN_VERSION: u16 = 0b0101_0101_0101_0101 + 3;

/// Fixed header size preceding the optional key structures
pub const KEYBIN_HEADER_SIZE: usize = 2 + 2 + 8 + 6 + 1 + 1 + 1 + 1 + 1;

const FILE_SUFFIX: &str = "-smpkey.bin";

/// Key mask bits that carry a persisted structure
const PERSISTED_KEYS: SmpKeyType = SmpKeyType::ENC_KEY
    .union(SmpKeyType::SIGN_KEY)
    .union(SmpKeyType::LINK_KEY);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpKeyBin {
    pub version: u16,
    pub size: u16,
    pub ts_creation_sec: u64,
    pub addr: BdAddressAndType,
    pub sec_level: BtSecurityLevel,
    pub io_cap: SmpIoCapability,
    pub keys_init: SmpKeyType,
    pub keys_resp: SmpKeyType,
    pub ltk_init: SmpLongTermKey,
    pub ltk_resp: SmpLongTermKey,
    pub csrk_init: SmpSignatureResolvingKey,
    pub csrk_resp: SmpSignatureResolvingKey,
    pub lk_init: SmpLinkKey,
    pub lk_resp: SmpLinkKey,
}

impl SmpKeyBin {
    /// Empty bin for an address, not valid until security and keys are set
    pub fn new(addr: BdAddressAndType) -> Self {
        let mut bin = Self {
            version: KEYBIN_VERSION,
            size: 0,
            ts_creation_sec: unix_seconds(),
            addr,
            sec_level: BtSecurityLevel::Unset,
            io_cap: SmpIoCapability::Unset,
            keys_init: SmpKeyType::empty(),
            keys_resp: SmpKeyType::empty(),
            ltk_init: SmpLongTermKey::default(),
            ltk_resp: SmpLongTermKey::default(),
            csrk_init: SmpSignatureResolvingKey::default(),
            csrk_resp: SmpSignatureResolvingKey::default(),
            lk_init: SmpLinkKey::default(),
            lk_resp: SmpLinkKey::default(),
        };
        bin.size = bin.calc_size();
        bin
    }

    /// Snapshot the negotiated keys of a paired device.
    ///
    /// The result is only valid if pairing completed with usable keys.
    pub fn create(addr: BdAddressAndType, pd: &PairingData) -> Self {
        let mut bin = Self::new(addr);
        if pd.state != SmpPairingState::Completed {
            return bin;
        }
        bin.sec_level = pd.sec_level_conn;
        bin.io_cap = pd.io_cap_conn;
        bin.keys_init = pd.keys_init_has & PERSISTED_KEYS;
        bin.keys_resp = pd.keys_resp_has & PERSISTED_KEYS;
        if bin.has_ltk_init() {
            bin.ltk_init = pd.ltk_init;
        }
        if bin.has_ltk_resp() {
            bin.ltk_resp = pd.ltk_resp;
        }
        if bin.keys_init.contains(SmpKeyType::SIGN_KEY) {
            bin.csrk_init = pd.csrk_init;
        }
        if bin.keys_resp.contains(SmpKeyType::SIGN_KEY) {
            bin.csrk_resp = pd.csrk_resp;
        }
        if bin.keys_init.contains(SmpKeyType::LINK_KEY) {
            bin.lk_init = pd.lk_init;
        }
        if bin.keys_resp.contains(SmpKeyType::LINK_KEY) {
            bin.lk_resp = pd.lk_resp;
        }
        bin.size = bin.calc_size();
        bin
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Size implied by the key masks
    pub fn calc_size(&self) -> u16 {
        let role = |mask: SmpKeyType| {
            let mut n = 0usize;
            if mask.contains(SmpKeyType::ENC_KEY) {
                n += SmpLongTermKey::ENCODED_SIZE;
            }
            if mask.contains(SmpKeyType::SIGN_KEY) {
                n += SmpSignatureResolvingKey::ENCODED_SIZE;
            }
            if mask.contains(SmpKeyType::LINK_KEY) {
                n += SmpLinkKey::ENCODED_SIZE;
            }
            n
        };
        (KEYBIN_HEADER_SIZE + role(self.keys_init) + role(self.keys_resp)) as u16
    }

    pub fn is_version_valid(&self) -> bool {
        self.version == KEYBIN_VERSION
    }

    pub fn is_size_valid(&self) -> bool {
        self.size == self.calc_size()
    }

    pub fn has_ltk_init(&self) -> bool {
        self.keys_init.contains(SmpKeyType::ENC_KEY)
    }

    pub fn has_ltk_resp(&self) -> bool {
        self.keys_resp.contains(SmpKeyType::ENC_KEY)
    }

    pub fn is_valid(&self) -> bool {
        self.is_version_valid()
            && self.is_size_valid()
            && self.sec_level != BtSecurityLevel::Unset
            && self.io_cap != SmpIoCapability::Unset
            && (!self.has_ltk_init() || self.ltk_init.is_valid())
            && (!self.has_ltk_resp() || self.ltk_resp.is_valid())
            && (!self.keys_init.contains(SmpKeyType::LINK_KEY) || self.lk_init.is_valid())
            && (!self.keys_resp.contains(SmpKeyType::LINK_KEY) || self.lk_resp.is_valid())
    }

    // ------------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.calc_size() as usize);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.ts_creation_sec.to_le_bytes());
        out.extend_from_slice(self.addr.address.as_bytes());
        out.push(self.addr.address_type.as_u8());
        out.push(self.sec_level.as_u8());
        out.push(self.io_cap.as_u8());
        out.push(self.keys_init.bits());
        out.push(self.keys_resp.bits());
        if self.has_ltk_init() {
            self.ltk_init.encode_into(&mut out);
        }
        if self.has_ltk_resp() {
            self.ltk_resp.encode_into(&mut out);
        }
        if self.keys_init.contains(SmpKeyType::SIGN_KEY) {
            self.csrk_init.encode_into(&mut out);
        }
        if self.keys_resp.contains(SmpKeyType::SIGN_KEY) {
            self.csrk_resp.encode_into(&mut out);
        }
        if self.keys_init.contains(SmpKeyType::LINK_KEY) {
            self.lk_init.encode_into(&mut out);
        }
        if self.keys_resp.contains(SmpKeyType::LINK_KEY) {
            self.lk_resp.encode_into(&mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        let version = r.u16()?;
        if version != KEYBIN_VERSION {
            return Err(PacketError::OutOfRange {
                field: "keybin_version",
                value: version as u32,
            });
        }
        let size = r.u16()?;
        if size as usize != bytes.len() {
            return Err(PacketError::LengthMismatch {
                declared: size as usize,
                actual: bytes.len(),
            });
        }
        let ts_creation_sec = r.u64()?;
        let address = BdAddress::new(r.array()?);
        let address_type = BdAddressType::from_u8(r.u8()?);
        let mut bin = Self::new(BdAddressAndType::new(address, address_type));
        bin.size = size;
        bin.ts_creation_sec = ts_creation_sec;
        bin.sec_level = BtSecurityLevel::from_u8(r.u8()?);
        bin.io_cap = SmpIoCapability::from_u8(r.u8()?);
        bin.keys_init = SmpKeyType::from_bits_truncate(r.u8()?);
        bin.keys_resp = SmpKeyType::from_bits_truncate(r.u8()?);
        if bin.has_ltk_init() {
            bin.ltk_init = SmpLongTermKey::decode(&mut r)?;
        }
        if bin.has_ltk_resp() {
            bin.ltk_resp = SmpLongTermKey::decode(&mut r)?;
        }
        if bin.keys_init.contains(SmpKeyType::SIGN_KEY) {
            bin.csrk_init = SmpSignatureResolvingKey::decode(&mut r)?;
        }
        if bin.keys_resp.contains(SmpKeyType::SIGN_KEY) {
            bin.csrk_resp = SmpSignatureResolvingKey::decode(&mut r)?;
        }
        if bin.keys_init.contains(SmpKeyType::LINK_KEY) {
            bin.lk_init = SmpLinkKey::decode(&mut r)?;
        }
        if bin.keys_resp.contains(SmpKeyType::LINK_KEY) {
            bin.lk_resp = SmpLinkKey::decode(&mut r)?;
        }
        if r.remaining() != 0 {
            return Err(PacketError::LengthMismatch {
                declared: bin.calc_size() as usize,
                actual: bytes.len(),
            });
        }
        Ok(bin)
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// `bd_<AA_BB_CC_DD_EE_FF>_<type>-smpkey.bin`
    pub fn file_name(addr: &BdAddressAndType) -> String {
        format!(
            "bd_{}_{}{}",
            addr.address.to_file_component(),
            addr.address_type.as_u8(),
            FILE_SUFFIX
        )
    }

    pub fn file_path(dir: &Path, addr: &BdAddressAndType) -> PathBuf {
        dir.join(Self::file_name(addr))
    }

    /// Write into `dir`, returning `Ok(false)` if a file exists and `overwrite` is off
    pub fn write(&self, dir: &Path, overwrite: bool) -> Result<bool, KeyStoreError> {
        if !self.is_valid() {
            return Err(KeyStoreError::InvalidKeys {
                reason: format!("refusing to write invalid key bin for {}", self.addr),
            });
        }
        let path = Self::file_path(dir, &self.addr);
        if path.exists() && !overwrite {
            debug!(path = %path.display(), "Key bin exists, not overwriting");
            return Ok(false);
        }
        let io_err = |source: io::Error| KeyStoreError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp).map_err(io_err)?;
            f.write_all(&self.encode()).map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &path).map_err(io_err)?;
        info!(path = %path.display(), "Wrote key bin for {}", self.addr);
        Ok(true)
    }

    /// Read the bin for `addr`; `Ok(None)` if absent, corrupt files are deleted
    pub fn read(dir: &Path, addr: &BdAddressAndType) -> Result<Option<Self>, KeyStoreError> {
        let path = Self::file_path(dir, addr);
        match Self::read_file(&path) {
            Ok(bin) if bin.addr != *addr => {
                remove_corrupt(&path, "address mismatch");
                Err(KeyStoreError::Invalid {
                    path,
                    reason: "address mismatch".into(),
                })
            }
            Ok(bin) => Ok(Some(bin)),
            Err(KeyStoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and validate one file, deleting it if it is not a valid bin
    pub fn read_file(path: &Path) -> Result<Self, KeyStoreError> {
        let bytes = fs::read(path).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reason = match Self::decode(&bytes) {
            Ok(bin) if bin.is_valid() => return Ok(bin),
            Ok(_) => "key bin failed validation".to_string(),
            Err(e) => e.to_string(),
        };
        remove_corrupt(path, &reason);
        Err(KeyStoreError::Invalid {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// All valid bins in `dir`, invalid ones are deleted
    pub fn read_all(dir: &Path) -> Result<Vec<Self>, KeyStoreError> {
        let entries = fs::read_dir(dir).map_err(|source| KeyStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_bin = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("bd_") && n.ends_with(FILE_SUFFIX))
                .unwrap_or(false);
            if !is_bin {
                continue;
            }
            match Self::read_file(&path) {
                Ok(bin) => out.push(bin),
                Err(e) => warn!("Skipping key bin: {}", e),
            }
        }
        Ok(out)
    }

    /// Delete the stored bin for `addr`, `Ok(false)` if there was none
    pub fn remove(dir: &Path, addr: &BdAddressAndType) -> Result<bool, KeyStoreError> {
        let path = Self::file_path(dir, addr);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(KeyStoreError::Io { path, source }),
        }
    }
}

fn remove_corrupt(path: &Path, reason: &str) {
    warn!(path = %path.display(), reason, "Deleting invalid key bin");
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), "Failed to delete invalid key bin: {}", e);
    }
}

impl fmt::Display for SmpKeyBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SMPKeyBin[{}, sec {:?}, io {:?}, init {:?}, resp {:?}, size {}, valid {}]",
            self.addr,
            self.sec_level,
            self.io_cap,
            self.keys_init,
            self.keys_resp,
            self.size,
            self.is_valid()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::keys::LtkProperties;

    fn paired() -> (BdAddressAndType, PairingData) {
        let addr = BdAddressAndType::new(
            BdAddress::new([0x01, 0x02, 0x03, 0xDA, 0x26, 0xC0]),
            BdAddressType::BdAddrLePublic,
        );
        let mut pd = PairingData {
            state: SmpPairingState::Completed,
            sec_level_conn: BtSecurityLevel::EncOnly,
            io_cap_conn: SmpIoCapability::NoInputNoOutput,
            keys_resp_has: SmpKeyType::ENC_KEY | SmpKeyType::ID_KEY | SmpKeyType::SIGN_KEY,
            ..PairingData::default()
        };
        pd.ltk_resp = SmpLongTermKey {
            properties: LtkProperties::RESPONDER,
            enc_size: 16,
            ediv: 0x1234,
            rand: 0x1122_3344_5566_7788,
            ltk: [0x42; 16],
        };
        pd.csrk_resp.csrk = [0x24; 16];
        (addr, pd)
    }

    #[test]
    fn file_name_format() {
        let (addr, _) = paired();
        assert_eq!(SmpKeyBin::file_name(&addr), "bd_C0_26_DA_03_02_01_1-smpkey.bin");
    }

    #[test]
    fn create_requires_completed_pairing() {
        let (addr, mut pd) = paired();
        assert!(SmpKeyBin::create(addr, &pd).is_valid());
        pd.state = SmpPairingState::KeyDistribution;
        assert!(!SmpKeyBin::create(addr, &pd).is_valid());
    }

    #[test]
    fn absent_keys_are_omitted() {
        let (addr, pd) = paired();
        let bin = SmpKeyBin::create(addr, &pd);
        // ID_KEY is not persisted
        assert_eq!(bin.keys_resp, SmpKeyType::ENC_KEY | SmpKeyType::SIGN_KEY);
        let bytes = bin.encode();
        assert_eq!(bytes.len(), KEYBIN_HEADER_SIZE + 28 + 17);
        assert_eq!(bytes.len(), bin.size as usize);
    }

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (addr, pd) = paired();
        let bin = SmpKeyBin::create(addr, &pd);
        assert!(bin.write(dir.path(), false).expect("write"));
        assert!(!bin.write(dir.path(), false).expect("second write"));
        let back = SmpKeyBin::read(dir.path(), &addr).expect("read").expect("present");
        assert_eq!(back, bin);
        assert!(SmpKeyBin::remove(dir.path(), &addr).expect("remove"));
        assert!(SmpKeyBin::read(dir.path(), &addr).expect("read").is_none());
        assert!(!SmpKeyBin::remove(dir.path(), &addr).expect("remove"));
    }

    #[test]
    fn corrupt_file_is_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (addr, pd) = paired();
        let mut bytes = SmpKeyBin::create(addr, &pd).encode();
        bytes.truncate(bytes.len() - 3);
        let path = SmpKeyBin::file_path(dir.path(), &addr);
        fs::write(&path, &bytes).expect("write");
        assert!(matches!(
            SmpKeyBin::read(dir.path(), &addr),
            Err(KeyStoreError::Invalid { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn refuses_to_write_invalid_bin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (addr, _) = paired();
        assert!(SmpKeyBin::new(addr).write(dir.path(), true).is_err());
    }
}
