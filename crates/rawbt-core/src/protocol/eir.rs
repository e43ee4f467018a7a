//! Extended inquiry response and advertising data
//!
//! Parses AD structures (`[len:1][type:1][data:len-1]`) from LE advertising
//! reports into an [`EInfoReport`] and encodes reports back into the 31-byte
//! advertising and scan-response payloads.

use bitflags::bitflags;
use uuid::Uuid;

use crate::errors::PacketError;
use crate::protocol::packet::Reader;
use crate::types::{monotonic_millis, BdAddress, BdAddressType};

/// Maximum legacy advertising/scan response payload
pub const MAX_AD_DATA_LEN: usize = 31;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const UUID16_INCOMPLETE: u8 = 0x02;
    pub const UUID16_COMPLETE: u8 = 0x03;
    pub const UUID32_INCOMPLETE: u8 = 0x04;
    pub const UUID32_COMPLETE: u8 = 0x05;
    pub const UUID128_INCOMPLETE: u8 = 0x06;
    pub const UUID128_COMPLETE: u8 = 0x07;
    pub const NAME_SHORT: u8 = 0x08;
    pub const NAME_COMPLETE: u8 = 0x09;
    pub const TX_POWER: u8 = 0x0A;
    pub const DEVICE_CLASS: u8 = 0x0D;
    pub const APPEARANCE: u8 = 0x19;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

bitflags! {
    /// Which `EInfoReport` fields are present or changed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EirDataType: u32 {
        const EVT_TYPE = 1 << 0;
        const BDADDR_TYPE = 1 << 1;
        const BDADDR = 1 << 2;
        const FLAGS = 1 << 3;
        const NAME = 1 << 4;
        const NAME_SHORT = 1 << 5;
        const RSSI = 1 << 6;
        const TX_POWER = 1 << 7;
        const MANUF_DATA = 1 << 8;
        const DEVICE_CLASS = 1 << 9;
        const APPEARANCE = 1 << 10;
        const SERVICE_UUID = 1 << 11;
    }
}

bitflags! {
    /// GAP advertising flags (AD type 0x01)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GapFlags: u8 {
        const LE_LIMITED_DISC = 1 << 0;
        const LE_GENERAL_DISC = 1 << 1;
        const BREDR_UNSUPPORTED = 1 << 2;
        const DUAL_SAME_CONTROLLER = 1 << 3;
        const DUAL_SAME_HOST = 1 << 4;
    }
}

/// Legacy advertising PDU type from the LE Advertising Report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdPduType {
    #[default]
    AdvInd,
    AdvDirectInd,
    AdvScanInd,
    AdvNonconnInd,
    ScanRsp,
    Unknown(u8),
}

impl AdPduType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::AdvInd,
            0x01 => Self::AdvDirectInd,
            0x02 => Self::AdvScanInd,
            0x03 => Self::AdvNonconnInd,
            0x04 => Self::ScanRsp,
            other => Self::Unknown(other),
        }
    }

    pub fn is_connectable(self) -> bool {
        matches!(self, Self::AdvInd | Self::AdvDirectInd)
    }
}

/// Manufacturer specific data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub company: u16,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// EInfoReport
// ----------------------------------------------------------------------------

/// One advertising report, or the accumulated view of a device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EInfoReport {
    pub timestamp: u64,
    pub evt_type: AdPduType,
    pub address: BdAddress,
    pub address_type: Option<BdAddressType>,
    pub rssi: i8,
    pub tx_power: Option<i8>,
    pub flags: GapFlags,
    pub name: Option<String>,
    pub name_short: Option<String>,
    pub services: Vec<Uuid>,
    pub services_complete: bool,
    pub manufacturer: Option<ManufacturerData>,
    pub appearance: Option<u16>,
    pub device_class: Option<u32>,
    /// Fields set in this report
    pub mask: EirDataType,
}

impl EInfoReport {
    pub fn new() -> Self {
        Self {
            timestamp: monotonic_millis(),
            ..Self::default()
        }
    }

    /// Parse a sequence of AD structures into this report
    pub fn read_ad_data(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let mut r = Reader::new(data);
        while r.remaining() > 0 {
            let len = r.u8()? as usize;
            if len == 0 {
                // Early termination padding
                break;
            }
            let field = r.take(len)?;
            let (kind, body) = (field[0], &field[1..]);
            self.apply_ad_field(kind, body)?;
        }
        Ok(())
    }

    fn apply_ad_field(&mut self, kind: u8, body: &[u8]) -> Result<(), PacketError> {
        match kind {
            ad_type::FLAGS => {
                if let Some(b) = body.first() {
                    self.flags = GapFlags::from_bits_truncate(*b);
                    self.mask |= EirDataType::FLAGS;
                }
            }
            ad_type::UUID16_INCOMPLETE | ad_type::UUID16_COMPLETE => {
                for c in body.chunks_exact(2) {
                    self.add_service(uuid16(u16::from_le_bytes([c[0], c[1]])));
                }
                self.services_complete |= kind == ad_type::UUID16_COMPLETE;
            }
            ad_type::UUID32_INCOMPLETE | ad_type::UUID32_COMPLETE => {
                for c in body.chunks_exact(4) {
                    self.add_service(uuid32(u32::from_le_bytes([c[0], c[1], c[2], c[3]])));
                }
                self.services_complete |= kind == ad_type::UUID32_COMPLETE;
            }
            ad_type::UUID128_INCOMPLETE | ad_type::UUID128_COMPLETE => {
                for c in body.chunks_exact(16) {
                    let mut b = [0u8; 16];
                    b.copy_from_slice(c);
                    b.reverse();
                    self.add_service(Uuid::from_bytes(b));
                }
                self.services_complete |= kind == ad_type::UUID128_COMPLETE;
            }
            ad_type::NAME_SHORT => {
                self.name_short = Some(String::from_utf8_lossy(body).into_owned());
                self.mask |= EirDataType::NAME_SHORT;
            }
            ad_type::NAME_COMPLETE => {
                self.name = Some(String::from_utf8_lossy(body).into_owned());
                self.mask |= EirDataType::NAME;
            }
            ad_type::TX_POWER => {
                if let Some(b) = body.first() {
                    self.tx_power = Some(*b as i8);
                    self.mask |= EirDataType::TX_POWER;
                }
            }
            ad_type::DEVICE_CLASS if body.len() >= 3 => {
                self.device_class = Some(u32::from_le_bytes([body[0], body[1], body[2], 0]));
                self.mask |= EirDataType::DEVICE_CLASS;
            }
            ad_type::APPEARANCE if body.len() >= 2 => {
                self.appearance = Some(u16::from_le_bytes([body[0], body[1]]));
                self.mask |= EirDataType::APPEARANCE;
            }
            ad_type::MANUFACTURER_DATA => {
                if body.len() < 2 {
                    return Err(PacketError::TooShort {
                        expected: 2,
                        actual: body.len(),
                    });
                }
                self.manufacturer = Some(ManufacturerData {
                    company: u16::from_le_bytes([body[0], body[1]]),
                    data: body[2..].to_vec(),
                });
                self.mask |= EirDataType::MANUF_DATA;
            }
            _ => {}
        }
        Ok(())
    }

    fn add_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
        self.mask |= EirDataType::SERVICE_UUID;
    }

    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = rssi;
        self.mask |= EirDataType::RSSI;
    }

    /// Merge the fields present in `other`, returning the fields whose value changed
    pub fn merge(&mut self, other: &EInfoReport) -> EirDataType {
        let mut changed = EirDataType::empty();
        self.timestamp = other.timestamp;
        if other.mask.contains(EirDataType::EVT_TYPE) && self.evt_type != other.evt_type {
            self.evt_type = other.evt_type;
            changed |= EirDataType::EVT_TYPE;
        }
        if other.mask.contains(EirDataType::RSSI) && self.rssi != other.rssi {
            self.rssi = other.rssi;
            changed |= EirDataType::RSSI;
        }
        if other.mask.contains(EirDataType::FLAGS) && self.flags != other.flags {
            self.flags = other.flags;
            changed |= EirDataType::FLAGS;
        }
        if other.mask.contains(EirDataType::NAME) && self.name != other.name {
            self.name = other.name.clone();
            changed |= EirDataType::NAME;
        }
        if other.mask.contains(EirDataType::NAME_SHORT) && self.name_short != other.name_short {
            self.name_short = other.name_short.clone();
            changed |= EirDataType::NAME_SHORT;
        }
        if other.mask.contains(EirDataType::TX_POWER) && self.tx_power != other.tx_power {
            self.tx_power = other.tx_power;
            changed |= EirDataType::TX_POWER;
        }
        if other.mask.contains(EirDataType::MANUF_DATA) && self.manufacturer != other.manufacturer
        {
            self.manufacturer = other.manufacturer.clone();
            changed |= EirDataType::MANUF_DATA;
        }
        if other.mask.contains(EirDataType::APPEARANCE) && self.appearance != other.appearance {
            self.appearance = other.appearance;
            changed |= EirDataType::APPEARANCE;
        }
        if other.mask.contains(EirDataType::DEVICE_CLASS) && self.device_class != other.device_class
        {
            self.device_class = other.device_class;
            changed |= EirDataType::DEVICE_CLASS;
        }
        if other.mask.contains(EirDataType::SERVICE_UUID) {
            for uuid in &other.services {
                if !self.services.contains(uuid) {
                    self.services.push(*uuid);
                    changed |= EirDataType::SERVICE_UUID;
                }
            }
            self.services_complete |= other.services_complete;
        }
        self.mask |= other.mask;
        changed
    }

    /// Encode the fields selected by `mask` as AD structures, truncated to 31 bytes
    pub fn write_ad_data(&self, mask: EirDataType) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_AD_DATA_LEN);
        let push = |kind: u8, body: &[u8], out: &mut Vec<u8>| {
            if out.len() + 2 + body.len() <= MAX_AD_DATA_LEN {
                out.push((body.len() + 1) as u8);
                out.push(kind);
                out.extend_from_slice(body);
            }
        };
        if mask.contains(EirDataType::FLAGS) && self.mask.contains(EirDataType::FLAGS) {
            push(ad_type::FLAGS, &[self.flags.bits()], &mut out);
        }
        if mask.contains(EirDataType::TX_POWER) {
            if let Some(tx) = self.tx_power {
                push(ad_type::TX_POWER, &[tx as u8], &mut out);
            }
        }
        if mask.contains(EirDataType::APPEARANCE) {
            if let Some(a) = self.appearance {
                push(ad_type::APPEARANCE, &a.to_le_bytes(), &mut out);
            }
        }
        if mask.contains(EirDataType::SERVICE_UUID) && !self.services.is_empty() {
            let mut short = Vec::new();
            let mut long = Vec::new();
            for uuid in &self.services {
                match as_uuid16(uuid) {
                    Some(v) => short.extend_from_slice(&v.to_le_bytes()),
                    None => {
                        let mut b = *uuid.as_bytes();
                        b.reverse();
                        long.extend_from_slice(&b);
                    }
                }
            }
            let (k16, k128) = if self.services_complete {
                (ad_type::UUID16_COMPLETE, ad_type::UUID128_COMPLETE)
            } else {
                (ad_type::UUID16_INCOMPLETE, ad_type::UUID128_INCOMPLETE)
            };
            if !short.is_empty() {
                push(k16, &short, &mut out);
            }
            if !long.is_empty() {
                push(k128, &long, &mut out);
            }
        }
        if mask.contains(EirDataType::MANUF_DATA) {
            if let Some(m) = &self.manufacturer {
                let mut body = m.company.to_le_bytes().to_vec();
                body.extend_from_slice(&m.data);
                push(ad_type::MANUFACTURER_DATA, &body, &mut out);
            }
        }
        if mask.contains(EirDataType::NAME) {
            if let Some(name) = &self.name {
                let room = MAX_AD_DATA_LEN.saturating_sub(out.len() + 2);
                if name.len() <= room {
                    push(ad_type::NAME_COMPLETE, name.as_bytes(), &mut out);
                } else if room > 0 {
                    push(ad_type::NAME_SHORT, &name.as_bytes()[..room], &mut out);
                }
            }
        } else if mask.contains(EirDataType::NAME_SHORT) {
            if let Some(name) = &self.name_short {
                push(ad_type::NAME_SHORT, name.as_bytes(), &mut out);
            }
        }
        out
    }
}

/// Expand a 16-bit assigned number to a full UUID
pub fn uuid16(value: u16) -> Uuid {
    uuid32(value as u32)
}

/// Expand a 32-bit assigned number to a full UUID
pub fn uuid32(value: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((value as u128) << 96))
}

/// Shorten a UUID built on the base UUID back to 16 bits
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let v = uuid.as_u128();
    let short = (v >> 96) as u32;
    if v & !(0xffff_ffffu128 << 96) == BASE_UUID && short <= u16::MAX as u32 {
        Some(short as u16)
    } else {
        None
    }
}

// ----------------------------------------------------------------------------
// LE Advertising Report
// ----------------------------------------------------------------------------

/// Decode the parameters of an LE Advertising Report subevent (without the subevent byte)
pub fn read_le_advertising_reports(params: &[u8]) -> Result<Vec<EInfoReport>, PacketError> {
    let mut r = Reader::new(params);
    let count = r.u8()?;
    if count == 0 || count > 0x19 {
        return Err(PacketError::OutOfRange {
            field: "num_reports",
            value: count as u32,
        });
    }
    let mut reports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut report = EInfoReport::new();
        report.evt_type = AdPduType::from_u8(r.u8()?);
        report.address_type = Some(BdAddressType::from_hci_le(r.u8()?));
        report.address = BdAddress::new(r.array()?);
        report.mask |= EirDataType::EVT_TYPE | EirDataType::BDADDR_TYPE | EirDataType::BDADDR;
        let len = r.u8()? as usize;
        if len > MAX_AD_DATA_LEN {
            return Err(PacketError::OutOfRange {
                field: "ad_data_len",
                value: len as u32,
            });
        }
        let data = r.take(len)?;
        report.read_ad_data(data)?;
        report.set_rssi(r.u8()? as i8);
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ad() -> Vec<u8> {
        vec![
            0x02, 0x01, 0x06, // flags
            0x03, 0x03, 0x0F, 0x18, // battery service
            0x05, 0x09, b'T', b'e', b's', b't', // name
            0x05, 0xFF, 0x59, 0x00, 0xAB, 0xCD, // manufacturer
        ]
    }

    #[test]
    fn parses_ad_structures() {
        let mut rep = EInfoReport::new();
        rep.read_ad_data(&sample_ad()).expect("parse");
        assert_eq!(rep.flags, GapFlags::LE_GENERAL_DISC | GapFlags::BREDR_UNSUPPORTED);
        assert_eq!(rep.name.as_deref(), Some("Test"));
        assert_eq!(rep.services, vec![uuid16(0x180F)]);
        assert!(rep.services_complete);
        let m = rep.manufacturer.as_ref().expect("manufacturer");
        assert_eq!(m.company, 0x0059);
        assert_eq!(m.data, vec![0xAB, 0xCD]);
        assert!(rep.mask.contains(EirDataType::NAME | EirDataType::SERVICE_UUID));
    }

    #[test]
    fn truncated_field_is_an_error() {
        let mut rep = EInfoReport::new();
        assert!(rep.read_ad_data(&[0x05, 0x09, b'a']).is_err());
    }

    #[test]
    fn advertising_report_with_rssi() {
        let ad = sample_ad();
        let mut params = vec![0x01, 0x00, 0x01, 1, 2, 3, 4, 5, 6, ad.len() as u8];
        params.extend_from_slice(&ad);
        params.push(0xC4); // -60 dBm
        let reports = read_le_advertising_reports(&params).expect("reports");
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.address, BdAddress::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(r.address_type, Some(BdAddressType::BdAddrLeRandom));
        assert_eq!(r.rssi, -60);
        assert!(r.evt_type.is_connectable());
    }

    #[test]
    fn merge_reports_changed_fields_only() {
        let mut base = EInfoReport::new();
        base.read_ad_data(&sample_ad()).expect("parse");
        let mut update = EInfoReport::new();
        update.read_ad_data(&[0x05, 0x09, b'T', b'e', b's', b't']).expect("parse");
        update.set_rssi(-40);
        let changed = base.merge(&update);
        assert_eq!(changed, EirDataType::RSSI);
    }

    #[test]
    fn encode_fits_in_legacy_payload() {
        let mut rep = EInfoReport::new();
        rep.flags = GapFlags::LE_GENERAL_DISC;
        rep.mask |= EirDataType::FLAGS;
        rep.services.push(uuid16(0x180D));
        rep.name = Some("a-rather-long-device-name-for-ads".into());
        let data = rep.write_ad_data(EirDataType::FLAGS | EirDataType::SERVICE_UUID | EirDataType::NAME);
        assert!(data.len() <= MAX_AD_DATA_LEN);
        let mut back = EInfoReport::new();
        back.read_ad_data(&data).expect("parse");
        assert_eq!(back.services, vec![uuid16(0x180D)]);
        assert!(back.name.is_none());
        assert!(back.name_short.is_some());
    }

    #[test]
    fn uuid16_round_trip() {
        assert_eq!(as_uuid16(&uuid16(0x2A00)), Some(0x2A00));
        assert_eq!(as_uuid16(&Uuid::from_u128(1)), None);
    }
}
