//! HCI command builders and Command Complete return-parameter decoders

use crate::errors::PacketError;
use crate::protocol::opcodes::cmd;
use crate::protocol::packet::{HciCommand, Reader};
use crate::protocol::params::{AdvertisingParams, LeConnParams, ScanParams};
use crate::status::HciStatusCode;
use crate::types::{BdAddress, BdAddressAndType};

pub const LOCAL_NAME_LEN: usize = 248;

// ----------------------------------------------------------------------------
// Controller Setup
// ----------------------------------------------------------------------------

pub fn reset() -> HciCommand {
    HciCommand::bare(cmd::RESET)
}

pub fn set_event_mask(mask: u64) -> HciCommand {
    HciCommand::new(cmd::SET_EVENT_MASK, mask.to_le_bytes().to_vec())
}

pub fn le_set_event_mask(mask: u64) -> HciCommand {
    HciCommand::new(cmd::LE_SET_EVENT_MASK, mask.to_le_bytes().to_vec())
}

pub fn write_local_name(name: &str) -> HciCommand {
    let mut params = vec![0u8; LOCAL_NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(LOCAL_NAME_LEN - 1);
    params[..len].copy_from_slice(&bytes[..len]);
    HciCommand::new(cmd::WRITE_LOCAL_NAME, params)
}

// ----------------------------------------------------------------------------
// Discovery and Advertising
// ----------------------------------------------------------------------------

pub fn le_set_scan_param(p: &ScanParams) -> HciCommand {
    let mut params = Vec::with_capacity(7);
    params.push(p.active as u8);
    params.extend_from_slice(&p.interval.to_le_bytes());
    params.extend_from_slice(&p.window.to_le_bytes());
    params.push(p.own_address_type);
    params.push(p.filter_policy);
    HciCommand::new(cmd::LE_SET_SCAN_PARAM, params)
}

pub fn le_set_scan_enable(enable: bool, filter_duplicates: bool) -> HciCommand {
    HciCommand::new(
        cmd::LE_SET_SCAN_ENABLE,
        vec![enable as u8, filter_duplicates as u8],
    )
}

pub fn le_set_adv_param(p: &AdvertisingParams) -> HciCommand {
    let mut params = Vec::with_capacity(15);
    params.extend_from_slice(&p.interval_min.to_le_bytes());
    params.extend_from_slice(&p.interval_max.to_le_bytes());
    params.push(p.adv_type.hci_value());
    params.push(p.own_address_type);
    params.push(0x00); // peer address type, unused for undirected
    params.extend_from_slice(&[0u8; 6]);
    params.push(p.channel_map);
    params.push(p.filter_policy);
    HciCommand::new(cmd::LE_SET_ADV_PARAM, params)
}

fn ad_payload(opcode: u16, data: &[u8]) -> HciCommand {
    let mut params = vec![0u8; 32];
    let len = data.len().min(31);
    params[0] = len as u8;
    params[1..=len].copy_from_slice(&data[..len]);
    HciCommand::new(opcode, params)
}

pub fn le_set_adv_data(data: &[u8]) -> HciCommand {
    ad_payload(cmd::LE_SET_ADV_DATA, data)
}

pub fn le_set_scan_rsp_data(data: &[u8]) -> HciCommand {
    ad_payload(cmd::LE_SET_SCAN_RSP_DATA, data)
}

pub fn le_set_adv_enable(enable: bool) -> HciCommand {
    HciCommand::new(cmd::LE_SET_ADV_ENABLE, vec![enable as u8])
}

// ----------------------------------------------------------------------------
// Filter Accept List
// ----------------------------------------------------------------------------

pub fn le_clear_white_list() -> HciCommand {
    HciCommand::bare(cmd::LE_CLEAR_WHITE_LIST)
}

fn white_list_entry(opcode: u16, peer: &BdAddressAndType) -> HciCommand {
    let mut params = Vec::with_capacity(7);
    params.push(peer.address_type.to_hci_le());
    params.extend_from_slice(peer.address.as_bytes());
    HciCommand::new(opcode, params)
}

pub fn le_add_to_white_list(peer: &BdAddressAndType) -> HciCommand {
    white_list_entry(cmd::LE_ADD_TO_WHITE_LIST, peer)
}

pub fn le_del_from_white_list(peer: &BdAddressAndType) -> HciCommand {
    white_list_entry(cmd::LE_DEL_FROM_WHITE_LIST, peer)
}

// ----------------------------------------------------------------------------
// Connections
// ----------------------------------------------------------------------------

/// LE Create Connection, `use_white_list` selects initiator filter policy 1
pub fn le_create_conn(
    peer: &BdAddressAndType,
    own_address_type: u8,
    p: &LeConnParams,
    use_white_list: bool,
) -> HciCommand {
    let mut params = Vec::with_capacity(25);
    params.extend_from_slice(&p.scan_interval.to_le_bytes());
    params.extend_from_slice(&p.scan_window.to_le_bytes());
    params.push(use_white_list as u8);
    params.push(peer.address_type.to_hci_le());
    params.extend_from_slice(peer.address.as_bytes());
    params.push(own_address_type);
    params.extend_from_slice(&p.conn_interval_min.to_le_bytes());
    params.extend_from_slice(&p.conn_interval_max.to_le_bytes());
    params.extend_from_slice(&p.conn_latency.to_le_bytes());
    params.extend_from_slice(&p.supervision_timeout_units().to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes()); // min CE length
    params.extend_from_slice(&0u16.to_le_bytes()); // max CE length
    HciCommand::new(cmd::LE_CREATE_CONN, params)
}

pub fn le_create_conn_cancel() -> HciCommand {
    HciCommand::bare(cmd::LE_CREATE_CONN_CANCEL)
}

/// BR/EDR Create Connection with DM1/DH1/DM3/DH3/DM5/DH5 packet types
pub fn create_conn(addr: &BdAddress, allow_role_switch: bool) -> HciCommand {
    let mut params = Vec::with_capacity(13);
    params.extend_from_slice(addr.as_bytes());
    params.extend_from_slice(&0xCC18u16.to_le_bytes());
    params.push(0x02); // page scan repetition mode R2
    params.push(0x00);
    params.extend_from_slice(&0u16.to_le_bytes()); // clock offset
    params.push(allow_role_switch as u8);
    HciCommand::new(cmd::CREATE_CONN, params)
}

pub fn disconnect(handle: u16, reason: HciStatusCode) -> HciCommand {
    let mut params = handle.to_le_bytes().to_vec();
    params.push(reason.as_u8());
    HciCommand::new(cmd::DISCONNECT, params)
}

pub fn le_read_remote_features(handle: u16) -> HciCommand {
    HciCommand::new(cmd::LE_READ_REMOTE_FEATURES, handle.to_le_bytes().to_vec())
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

pub fn le_enable_encryption(handle: u16, rand: u64, ediv: u16, ltk: &[u8; 16]) -> HciCommand {
    let mut params = Vec::with_capacity(28);
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&rand.to_le_bytes());
    params.extend_from_slice(&ediv.to_le_bytes());
    params.extend_from_slice(ltk);
    HciCommand::new(cmd::LE_ENABLE_ENC, params)
}

pub fn le_ltk_reply(handle: u16, ltk: &[u8; 16]) -> HciCommand {
    let mut params = handle.to_le_bytes().to_vec();
    params.extend_from_slice(ltk);
    HciCommand::new(cmd::LE_LTK_REPLY, params)
}

pub fn le_ltk_neg_reply(handle: u16) -> HciCommand {
    HciCommand::new(cmd::LE_LTK_NEG_REPLY, handle.to_le_bytes().to_vec())
}

pub fn le_read_local_p256_public_key() -> HciCommand {
    HciCommand::bare(cmd::LE_READ_LOCAL_P256_PUBLIC_KEY)
}

/// LE Generate DHKey with the peer's public key in wire order (X then Y, LE)
pub fn le_generate_dhkey(remote_public_key: &[u8; 64]) -> HciCommand {
    HciCommand::new(cmd::LE_GENERATE_DHKEY, remote_public_key.to_vec())
}

// ----------------------------------------------------------------------------
// Return Parameters
// ----------------------------------------------------------------------------

/// First return parameter of most Command Complete events
pub fn reply_status(ret: &[u8]) -> HciStatusCode {
    ret.first()
        .map(|b| HciStatusCode::from_u8(*b))
        .unwrap_or(HciStatusCode::Unknown)
}

pub fn read_bd_addr_reply(ret: &[u8]) -> Result<BdAddress, PacketError> {
    let mut r = Reader::new(ret);
    let _status = r.u8()?;
    Ok(BdAddress::new(r.array()?))
}

/// HCI Read Local Version return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

pub fn read_local_version_reply(ret: &[u8]) -> Result<LocalVersion, PacketError> {
    let mut r = Reader::new(ret);
    let _status = r.u8()?;
    Ok(LocalVersion {
        hci_version: r.u8()?,
        hci_revision: r.u16()?,
        lmp_version: r.u8()?,
        manufacturer: r.u16()?,
        lmp_subversion: r.u16()?,
    })
}

pub fn read_local_name_reply(ret: &[u8]) -> Result<String, PacketError> {
    let mut r = Reader::new(ret);
    let _status = r.u8()?;
    let raw = r.rest();
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// LE ACL buffer size and count
pub fn le_read_buffer_size_reply(ret: &[u8]) -> Result<(u16, u8), PacketError> {
    let mut r = Reader::new(ret);
    let _status = r.u8()?;
    Ok((r.u16()?, r.u8()?))
}

pub fn le_read_local_features_reply(ret: &[u8]) -> Result<u64, PacketError> {
    let mut r = Reader::new(ret);
    let _status = r.u8()?;
    r.u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BdAddressType;

    #[test]
    fn le_create_conn_layout() {
        let peer = BdAddressAndType::new(
            BdAddress::new([1, 2, 3, 4, 5, 6]),
            BdAddressType::BdAddrLeRandom,
        );
        let c = le_create_conn(&peer, 0, &LeConnParams::default(), false);
        assert_eq!(c.opcode, cmd::LE_CREATE_CONN);
        assert_eq!(c.params.len(), 25);
        assert_eq!(c.params[5], 0x01);
        assert_eq!(&c.params[6..12], &[1, 2, 3, 4, 5, 6]);
        // supervision timeout 50 units at offset 19
        assert_eq!(u16::from_le_bytes([c.params[19], c.params[20]]), 50);
    }

    #[test]
    fn encryption_and_disconnect_layout() {
        let c = le_enable_encryption(0x0040, 0x1122, 0x3344, &[0xAA; 16]);
        assert_eq!(c.params.len(), 28);
        assert_eq!(&c.params[..2], &[0x40, 0x00]);
        let d = disconnect(0x0040, HciStatusCode::RemoteUserTerminatedConnection);
        assert_eq!(d.params, vec![0x40, 0x00, 0x13]);
    }

    #[test]
    fn decodes_replies() {
        let addr = read_bd_addr_reply(&[0, 6, 5, 4, 3, 2, 1]).expect("addr");
        assert_eq!(addr.to_string(), "01:02:03:04:05:06");
        let mut name = vec![0u8];
        name.extend_from_slice(b"hci0-name\0\0\0");
        assert_eq!(read_local_name_reply(&name).expect("name"), "hci0-name");
        assert_eq!(le_read_buffer_size_reply(&[0, 27, 0, 8]).expect("buf"), (27, 8));
        assert_eq!(reply_status(&[]), HciStatusCode::Unknown);
        assert!(read_local_version_reply(&[0, 9]).is_err());
    }

    #[test]
    fn ad_payload_is_padded() {
        let c = le_set_adv_data(&[2, 1, 6]);
        assert_eq!(c.params.len(), 32);
        assert_eq!(&c.params[..4], &[3, 2, 1, 6]);
    }
}
