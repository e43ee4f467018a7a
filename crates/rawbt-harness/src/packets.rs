//! H4 packet builders for controller-originated traffic

use rawbt_core::protocol::l2cap::cid;
use rawbt_core::protocol::opcodes::{evt, le_sub};
use rawbt_core::protocol::{HciPacketType, PacketBoundary};
use rawbt_core::smp::SmpPdu;
use rawbt_core::{BdAddress, BdAddressAndType, BtRole, HciStatusCode};

/// `[0x04][code][len][params]`
pub fn event(code: u8, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + params.len());
    out.push(HciPacketType::Event as u8);
    out.push(code);
    out.push(params.len() as u8);
    out.extend_from_slice(params);
    out
}

/// LE Meta event with the subevent code in front of its parameters
pub fn le_meta(subevent: u8, params: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + params.len());
    body.push(subevent);
    body.extend_from_slice(params);
    event(evt::LE_META, &body)
}

pub fn command_complete(opcode: u16, return_params: &[u8]) -> Vec<u8> {
    let mut p = vec![1u8];
    p.extend_from_slice(&opcode.to_le_bytes());
    p.extend_from_slice(return_params);
    event(evt::CMD_COMPLETE, &p)
}

pub fn command_status(status: HciStatusCode, opcode: u16) -> Vec<u8> {
    let mut p = vec![status.as_u8(), 1];
    p.extend_from_slice(&opcode.to_le_bytes());
    event(evt::CMD_STATUS, &p)
}

pub fn connection_complete(status: HciStatusCode, handle: u16, address: &BdAddress) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(&handle.to_le_bytes());
    p.extend_from_slice(address.as_bytes());
    p.push(0x01); // ACL link
    p.push(0x00);
    event(evt::CONN_COMPLETE, &p)
}

pub fn le_connection_complete(
    status: HciStatusCode,
    handle: u16,
    role: BtRole,
    peer: &BdAddressAndType,
    interval: u16,
    supervision_timeout: u16,
) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(if role == BtRole::Slave { 1 } else { 0 });
    p.push(peer.address_type.to_hci_le());
    p.extend_from_slice(peer.address.as_bytes());
    p.extend_from_slice(&interval.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&supervision_timeout.to_le_bytes());
    p.push(0x00); // master clock accuracy
    le_meta(le_sub::CONN_COMPLETE, &p)
}

pub fn disconnection_complete(handle: u16, reason: HciStatusCode) -> Vec<u8> {
    let mut p = vec![HciStatusCode::Success.as_u8()];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(reason.as_u8());
    event(evt::DISCONN_COMPLETE, &p)
}

pub fn encryption_change(status: HciStatusCode, handle: u16, enabled: bool) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(enabled as u8);
    event(evt::ENCRYPT_CHANGE, &p)
}

pub fn hardware_error(code: u8) -> Vec<u8> {
    event(evt::HARDWARE_ERROR, &[code])
}

/// Single-report LE advertising event
pub fn le_advertising_report(
    peer: &BdAddressAndType,
    evt_type: u8,
    ad_data: &[u8],
    rssi: i8,
) -> Vec<u8> {
    let mut p = vec![1u8, evt_type, peer.address_type.to_hci_le()];
    p.extend_from_slice(peer.address.as_bytes());
    p.push(ad_data.len() as u8);
    p.extend_from_slice(ad_data);
    p.push(rssi as u8);
    le_meta(le_sub::ADVERTISING_REPORT, &p)
}

pub fn le_remote_features(status: HciStatusCode, handle: u16, features: u64) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(&handle.to_le_bytes());
    p.extend_from_slice(&features.to_le_bytes());
    le_meta(le_sub::REMOTE_FEATURES_COMPLETE, &p)
}

pub fn le_ltk_request(handle: u16, rand: u64, ediv: u16) -> Vec<u8> {
    let mut p = handle.to_le_bytes().to_vec();
    p.extend_from_slice(&rand.to_le_bytes());
    p.extend_from_slice(&ediv.to_le_bytes());
    le_meta(le_sub::LTK_REQUEST, &p)
}

pub fn le_read_local_p256_complete(status: HciStatusCode, key: &[u8; 64]) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(key);
    le_meta(le_sub::READ_LOCAL_P256_PUBKEY_COMPLETE, &p)
}

pub fn le_generate_dhkey_complete(status: HciStatusCode, dhkey: &[u8; 32]) -> Vec<u8> {
    let mut p = vec![status.as_u8()];
    p.extend_from_slice(dhkey);
    le_meta(le_sub::GENERATE_DHKEY_COMPLETE, &p)
}

/// One unfragmented ACL packet carrying a complete L2CAP frame
pub fn acl_l2cap(handle: u16, channel: u16, payload: &[u8]) -> Vec<u8> {
    let l2cap_len = payload.len() as u16;
    let acl_len = l2cap_len + 4;
    let flags = (PacketBoundary::FirstFlushable as u16) << 12;
    let mut out = Vec::with_capacity(9 + payload.len());
    out.push(HciPacketType::AclData as u8);
    out.extend_from_slice(&((handle & 0x0fff) | flags).to_le_bytes());
    out.extend_from_slice(&acl_len.to_le_bytes());
    out.extend_from_slice(&l2cap_len.to_le_bytes());
    out.extend_from_slice(&channel.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn acl_smp(handle: u16, pdu: &SmpPdu) -> Vec<u8> {
    acl_l2cap(handle, cid::SMP, &pdu.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::protocol::{HciEventData, HciPacket};

    #[test]
    fn built_events_decode() {
        let bytes = command_status(HciStatusCode::ConnectionRejectedSecurity, 0x200D);
        match HciPacket::decode(&bytes).expect("decode") {
            HciPacket::Event(ev) => match HciEventData::decode(&ev).expect("event") {
                HciEventData::CommandStatus { status, opcode, .. } => {
                    assert_eq!(status, HciStatusCode::ConnectionRejectedSecurity);
                    assert_eq!(opcode, 0x200D);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let acl = acl_l2cap(0x41, cid::ATT, &[1, 2, 3]);
        match HciPacket::decode(&acl).expect("decode") {
            HciPacket::Acl(a) => {
                assert_eq!(a.handle, 0x41);
                assert_eq!(a.data.len(), 7);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
