//! HCI opcode, event code and LE subevent tables

// ----------------------------------------------------------------------------
// Command Opcodes
// ----------------------------------------------------------------------------

/// Build an opcode from OGF and OCF
pub const fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | (ocf & 0x03ff)
}

pub mod cmd {
    // Link control (OGF 0x01)
    pub const CREATE_CONN: u16 = 0x0405;
    pub const DISCONNECT: u16 = 0x0406;

    // Controller and baseband (OGF 0x03)
    pub const SET_EVENT_MASK: u16 = 0x0C01;
    pub const RESET: u16 = 0x0C03;
    pub const WRITE_LOCAL_NAME: u16 = 0x0C13;
    pub const READ_LOCAL_NAME: u16 = 0x0C14;

    // Informational (OGF 0x04)
    pub const READ_LOCAL_VERSION: u16 = 0x1001;
    pub const READ_BD_ADDR: u16 = 0x1009;

    // LE controller (OGF 0x08)
    pub const LE_SET_EVENT_MASK: u16 = 0x2001;
    pub const LE_READ_BUFFER_SIZE: u16 = 0x2002;
    pub const LE_READ_LOCAL_FEATURES: u16 = 0x2003;
    pub const LE_SET_ADV_PARAM: u16 = 0x2006;
    pub const LE_SET_ADV_DATA: u16 = 0x2008;
    pub const LE_SET_SCAN_RSP_DATA: u16 = 0x2009;
    pub const LE_SET_ADV_ENABLE: u16 = 0x200A;
    pub const LE_SET_SCAN_PARAM: u16 = 0x200B;
    pub const LE_SET_SCAN_ENABLE: u16 = 0x200C;
    pub const LE_CREATE_CONN: u16 = 0x200D;
    pub const LE_CREATE_CONN_CANCEL: u16 = 0x200E;
    pub const LE_CLEAR_WHITE_LIST: u16 = 0x2010;
    pub const LE_ADD_TO_WHITE_LIST: u16 = 0x2011;
    pub const LE_DEL_FROM_WHITE_LIST: u16 = 0x2012;
    pub const LE_READ_REMOTE_FEATURES: u16 = 0x2016;
    pub const LE_ENABLE_ENC: u16 = 0x2019;
    pub const LE_LTK_REPLY: u16 = 0x201A;
    pub const LE_LTK_NEG_REPLY: u16 = 0x201B;
    pub const LE_READ_LOCAL_P256_PUBLIC_KEY: u16 = 0x2025;
    pub const LE_GENERATE_DHKEY: u16 = 0x2026;

    /// Human readable opcode name for logs
    pub fn name(opcode: u16) -> &'static str {
        match opcode {
            CREATE_CONN => "CREATE_CONN",
            DISCONNECT => "DISCONNECT",
            SET_EVENT_MASK => "SET_EVENT_MASK",
            RESET => "RESET",
            WRITE_LOCAL_NAME => "WRITE_LOCAL_NAME",
            READ_LOCAL_NAME => "READ_LOCAL_NAME",
            READ_LOCAL_VERSION => "READ_LOCAL_VERSION",
            READ_BD_ADDR => "READ_BD_ADDR",
            LE_SET_EVENT_MASK => "LE_SET_EVENT_MASK",
            LE_READ_BUFFER_SIZE => "LE_READ_BUFFER_SIZE",
            LE_READ_LOCAL_FEATURES => "LE_READ_LOCAL_FEATURES",
            LE_SET_ADV_PARAM => "LE_SET_ADV_PARAM",
            LE_SET_ADV_DATA => "LE_SET_ADV_DATA",
            LE_SET_SCAN_RSP_DATA => "LE_SET_SCAN_RSP_DATA",
            LE_SET_ADV_ENABLE => "LE_SET_ADV_ENABLE",
            LE_SET_SCAN_PARAM => "LE_SET_SCAN_PARAM",
            LE_SET_SCAN_ENABLE => "LE_SET_SCAN_ENABLE",
            LE_CREATE_CONN => "LE_CREATE_CONN",
            LE_CREATE_CONN_CANCEL => "LE_CREATE_CONN_CANCEL",
            LE_CLEAR_WHITE_LIST => "LE_CLEAR_WHITE_LIST",
            LE_ADD_TO_WHITE_LIST => "LE_ADD_TO_WHITE_LIST",
            LE_DEL_FROM_WHITE_LIST => "LE_DEL_FROM_WHITE_LIST",
            LE_READ_REMOTE_FEATURES => "LE_READ_REMOTE_FEATURES",
            LE_ENABLE_ENC => "LE_ENABLE_ENC",
            LE_LTK_REPLY => "LE_LTK_REPLY",
            LE_LTK_NEG_REPLY => "LE_LTK_NEG_REPLY",
            LE_READ_LOCAL_P256_PUBLIC_KEY => "LE_READ_LOCAL_P256_PUBLIC_KEY",
            LE_GENERATE_DHKEY => "LE_GENERATE_DHKEY",
            _ => "UNKNOWN",
        }
    }
}

// ----------------------------------------------------------------------------
// Event Codes
// ----------------------------------------------------------------------------

pub mod evt {
    pub const CONN_COMPLETE: u8 = 0x03;
    pub const DISCONN_COMPLETE: u8 = 0x05;
    pub const ENCRYPT_CHANGE: u8 = 0x08;
    pub const CMD_COMPLETE: u8 = 0x0E;
    pub const CMD_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUM_COMP_PKTS: u8 = 0x13;
    pub const ENCRYPT_KEY_REFRESH_COMPLETE: u8 = 0x30;
    pub const LE_META: u8 = 0x3E;
}

pub mod le_sub {
    pub const CONN_COMPLETE: u8 = 0x01;
    pub const ADVERTISING_REPORT: u8 = 0x02;
    pub const REMOTE_FEATURES_COMPLETE: u8 = 0x04;
    pub const LTK_REQUEST: u8 = 0x05;
    pub const READ_LOCAL_P256_PUBKEY_COMPLETE: u8 = 0x08;
    pub const GENERATE_DHKEY_COMPLETE: u8 = 0x09;
    pub const ENHANCED_CONN_COMPLETE: u8 = 0x0A;
}

// ----------------------------------------------------------------------------
// Event Masks
// ----------------------------------------------------------------------------

/// Events enabled with Set Event Mask
pub const DEFAULT_EVENT_MASK: u64 = (1 << (evt::CONN_COMPLETE - 1))
    | (1 << (evt::DISCONN_COMPLETE - 1))
    | (1 << (evt::ENCRYPT_CHANGE - 1))
    | (1 << (evt::HARDWARE_ERROR - 1))
    | (1 << (evt::ENCRYPT_KEY_REFRESH_COMPLETE - 1))
    | (1 << 61);

/// LE subevents enabled with LE Set Event Mask
pub const DEFAULT_LE_EVENT_MASK: u64 = (1 << (le_sub::CONN_COMPLETE - 1))
    | (1 << (le_sub::ADVERTISING_REPORT - 1))
    | (1 << (le_sub::REMOTE_FEATURES_COMPLETE - 1))
    | (1 << (le_sub::LTK_REQUEST - 1))
    | (1 << (le_sub::READ_LOCAL_P256_PUBKEY_COMPLETE - 1))
    | (1 << (le_sub::GENERATE_DHKEY_COMPLETE - 1))
    | (1 << (le_sub::ENHANCED_CONN_COMPLETE - 1));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_composition_matches_table() {
        assert_eq!(opcode(0x08, 0x000D), cmd::LE_CREATE_CONN);
        assert_eq!(opcode(0x03, 0x0003), cmd::RESET);
        assert_eq!(opcode(0x01, 0x0006), cmd::DISCONNECT);
        assert_eq!(cmd::name(cmd::LE_SET_SCAN_ENABLE), "LE_SET_SCAN_ENABLE");
    }
}
