//! Scan, connection and advertising parameters
//!
//! Controller time values are integers in fixed tick sizes: scan and
//! advertising intervals in 0.625 ms, connection intervals in 1.25 ms and
//! supervision timeouts in 10 ms. The helpers here convert between
//! milliseconds and ticks and clamp to the ranges the controller accepts.

use serde::{Deserialize, Serialize};

use crate::status::HciStatusCode;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const SCAN_INTERVAL_MIN: u16 = 0x0004;
pub const SCAN_INTERVAL_MAX: u16 = 0x4000;
pub const CONN_INTERVAL_MIN: u16 = 0x0006;
pub const CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const CONN_LATENCY_MAX: u16 = 0x01F3;
pub const SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;
/// Largest accepted safety factor for derived supervision timeouts
pub const SUPERVISION_MULTIPLIER_MAX: u16 = 100;
pub const ADV_INTERVAL_MIN: u16 = 0x0020;
pub const ADV_INTERVAL_MAX: u16 = 0x4000;

/// Lower bound for derived supervision timeouts
pub const LE_CONN_MIN_TIMEOUT_MS: u32 = 500;

// ----------------------------------------------------------------------------
// Unit Conversions
// ----------------------------------------------------------------------------

/// 0.625 ms ticks to milliseconds
pub fn ticks_0_625_to_ms(ticks: u16) -> f64 {
    ticks as f64 * 0.625
}

/// Milliseconds to 0.625 ms ticks, rounded down
pub fn ms_to_ticks_0_625(ms: f64) -> u16 {
    (ms / 0.625).clamp(0.0, u16::MAX as f64) as u16
}

/// 1.25 ms ticks to milliseconds
pub fn ticks_1_25_to_ms(ticks: u16) -> f64 {
    ticks as f64 * 1.25
}

/// Milliseconds to 1.25 ms ticks, rounded down
pub fn ms_to_ticks_1_25(ms: f64) -> u16 {
    (ms / 1.25).clamp(0.0, u16::MAX as f64) as u16
}

/// Supervision timeout in 10 ms units for the given latency and max interval.
///
/// `max(min_ms, (1 + latency) * interval_max_ms * max(2, multiplier)) / 10`,
/// then clamped to the controller's accepted range.
pub fn hci_conn_supervisor_timeout(
    conn_latency: u16,
    conn_interval_max_ms: u32,
    min_result_ms: u32,
    multiplier: u16,
) -> u16 {
    let derived = (1 + conn_latency as u64)
        .saturating_mul(conn_interval_max_ms as u64)
        .saturating_mul(multiplier.max(2) as u64);
    let units = derived.max(min_result_ms as u64) / 10;
    units.clamp(SUPERVISION_TIMEOUT_MIN as u64, SUPERVISION_TIMEOUT_MAX as u64) as u16
}

/// [`hci_conn_supervisor_timeout`] with the default lower bound and multiplier 10
pub fn default_conn_supervisor_timeout(conn_latency: u16, conn_interval_max_ms: u32) -> u16 {
    hci_conn_supervisor_timeout(conn_latency, conn_interval_max_ms, LE_CONN_MIN_TIMEOUT_MS, 10)
}

// ----------------------------------------------------------------------------
// Scan Parameters
// ----------------------------------------------------------------------------

/// LE scan parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    pub active: bool,
    /// 0.625 ms ticks
    pub interval: u16,
    /// 0.625 ms ticks
    pub window: u16,
    pub own_address_type: u8,
    pub filter_policy: u8,
    pub filter_duplicates: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: true,
            interval: 24,
            window: 24,
            own_address_type: 0,
            filter_policy: 0,
            filter_duplicates: true,
        }
    }
}

impl ScanParams {
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_interval_window(mut self, interval: u16, window: u16) -> Self {
        self.interval = interval;
        self.window = window;
        self
    }

    pub fn with_filter_duplicates(mut self, filter: bool) -> Self {
        self.filter_duplicates = filter;
        self
    }

    pub fn validate(&self) -> Result<(), HciStatusCode> {
        let range = SCAN_INTERVAL_MIN..=SCAN_INTERVAL_MAX;
        if !range.contains(&self.interval) || !range.contains(&self.window) {
            return Err(HciStatusCode::InvalidHciCommandParameters);
        }
        if self.window > self.interval {
            return Err(HciStatusCode::InvalidHciCommandParameters);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Parameters
// ----------------------------------------------------------------------------

/// LE Create Connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeConnParams {
    /// 0.625 ms ticks
    pub scan_interval: u16,
    /// 0.625 ms ticks
    pub scan_window: u16,
    /// 1.25 ms ticks
    pub conn_interval_min: u16,
    /// 1.25 ms ticks
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    /// 10 ms units, derived from the other values when `None`
    pub supervision_timeout: Option<u16>,
    pub supervision_multiplier: u16,
    pub min_supervision_timeout_ms: u32,
}

impl Default for LeConnParams {
    fn default() -> Self {
        Self {
            scan_interval: 24,
            scan_window: 24,
            conn_interval_min: 8,
            conn_interval_max: 12,
            conn_latency: 0,
            supervision_timeout: None,
            supervision_multiplier: 10,
            min_supervision_timeout_ms: LE_CONN_MIN_TIMEOUT_MS,
        }
    }
}

impl LeConnParams {
    pub fn with_conn_interval(mut self, min: u16, max: u16) -> Self {
        self.conn_interval_min = min;
        self.conn_interval_max = max;
        self
    }

    pub fn with_latency(mut self, latency: u16) -> Self {
        self.conn_latency = latency;
        self
    }

    pub fn with_supervision_timeout(mut self, units: u16) -> Self {
        self.supervision_timeout = Some(units);
        self
    }

    /// Effective supervision timeout in 10 ms units
    pub fn supervision_timeout_units(&self) -> u16 {
        self.supervision_timeout.unwrap_or_else(|| {
            hci_conn_supervisor_timeout(
                self.conn_latency,
                ticks_1_25_to_ms(self.conn_interval_max) as u32,
                self.min_supervision_timeout_ms,
                self.supervision_multiplier,
            )
        })
    }

    /// Check the values the controller would reject up front
    pub fn validate(&self) -> Result<(), HciStatusCode> {
        let scan = SCAN_INTERVAL_MIN..=SCAN_INTERVAL_MAX;
        if !scan.contains(&self.scan_interval)
            || !scan.contains(&self.scan_window)
            || self.scan_window > self.scan_interval
        {
            return Err(HciStatusCode::InvalidHciCommandParameters);
        }
        let conn = CONN_INTERVAL_MIN..=CONN_INTERVAL_MAX;
        if !conn.contains(&self.conn_interval_min)
            || !conn.contains(&self.conn_interval_max)
            || self.conn_interval_min > self.conn_interval_max
            || self.conn_latency > CONN_LATENCY_MAX
            || self.supervision_multiplier > SUPERVISION_MULTIPLIER_MAX
        {
            return Err(HciStatusCode::UnacceptableConnectionParam);
        }
        let timeout = self.supervision_timeout_units();
        if !(SUPERVISION_TIMEOUT_MIN..=SUPERVISION_TIMEOUT_MAX).contains(&timeout) {
            return Err(HciStatusCode::UnacceptableConnectionParam);
        }
        // Timeout must exceed (1 + latency) * interval_max * 2
        let floor_ms = (1 + self.conn_latency as u32) as f64
            * ticks_1_25_to_ms(self.conn_interval_max)
            * 2.0;
        if timeout as f64 * 10.0 <= floor_ms {
            return Err(HciStatusCode::UnacceptableConnectionParam);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Advertising Parameters
// ----------------------------------------------------------------------------

/// Legacy advertising PDU kinds selectable for LE Set Advertising Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdvertisingType {
    #[default]
    ConnectableUndirected,
    ScannableUndirected,
    NonConnectableUndirected,
}

impl AdvertisingType {
    pub fn hci_value(self) -> u8 {
        match self {
            Self::ConnectableUndirected => 0x00,
            Self::ScannableUndirected => 0x02,
            Self::NonConnectableUndirected => 0x03,
        }
    }
}

/// LE advertising parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingParams {
    /// 0.625 ms ticks
    pub interval_min: u16,
    /// 0.625 ms ticks
    pub interval_max: u16,
    pub adv_type: AdvertisingType,
    pub own_address_type: u8,
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl Default for AdvertisingParams {
    fn default() -> Self {
        Self {
            interval_min: 160,
            interval_max: 480,
            adv_type: AdvertisingType::ConnectableUndirected,
            own_address_type: 0,
            channel_map: 0x07,
            filter_policy: 0,
        }
    }
}

impl AdvertisingParams {
    pub fn validate(&self) -> Result<(), HciStatusCode> {
        let range = ADV_INTERVAL_MIN..=ADV_INTERVAL_MAX;
        if !range.contains(&self.interval_min)
            || !range.contains(&self.interval_max)
            || self.interval_min > self.interval_max
            || self.channel_map & 0x07 == 0
        {
            return Err(HciStatusCode::InvalidHciCommandParameters);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_timeout_minimum_clamp() {
        // 50 units of 10 ms, the 500 ms floor
        let units = default_conn_supervisor_timeout(0, 50);
        assert_eq!(units, 50);
        assert_eq!(units as u32 * 10, 500);
    }

    #[test]
    fn supervisor_timeout_with_multiplier() {
        assert_eq!(hci_conn_supervisor_timeout(0, 15, 500, 10), 50);
        assert_eq!(hci_conn_supervisor_timeout(4, 100, 500, 10), 500);
        // multiplier below 2 is raised to 2
        assert_eq!(hci_conn_supervisor_timeout(0, 400, 500, 1), 80);
        // clamped to the controller maximum
        assert_eq!(hci_conn_supervisor_timeout(10, 4000, 500, 10), SUPERVISION_TIMEOUT_MAX);
    }

    #[test]
    fn supervisor_timeout_at_the_limits() {
        let max_interval_ms = ticks_1_25_to_ms(CONN_INTERVAL_MAX) as u32;
        assert_eq!(
            hci_conn_supervisor_timeout(CONN_LATENCY_MAX, max_interval_ms, 500, 3000),
            SUPERVISION_TIMEOUT_MAX
        );
        assert_eq!(
            hci_conn_supervisor_timeout(u16::MAX, u32::MAX, u32::MAX, u16::MAX),
            SUPERVISION_TIMEOUT_MAX
        );
        assert_eq!(hci_conn_supervisor_timeout(0, 0, 0, 0), SUPERVISION_TIMEOUT_MIN);
    }

    #[test]
    fn rejects_oversized_supervision_multiplier() {
        let p = LeConnParams {
            supervision_multiplier: SUPERVISION_MULTIPLIER_MAX + 1,
            ..LeConnParams::default()
        };
        assert_eq!(p.validate(), Err(HciStatusCode::UnacceptableConnectionParam));
        let p = LeConnParams {
            supervision_multiplier: SUPERVISION_MULTIPLIER_MAX,
            ..LeConnParams::default()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn tick_conversions() {
        assert_eq!(ticks_1_25_to_ms(12), 15.0);
        assert_eq!(ms_to_ticks_1_25(15.0), 12);
        assert_eq!(ticks_0_625_to_ms(24), 15.0);
        assert_eq!(ms_to_ticks_0_625(15.0), 24);
    }

    #[test]
    fn default_conn_params_are_acceptable() {
        let p = LeConnParams::default();
        assert_eq!(p.supervision_timeout_units(), 50);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn rejects_unacceptable_conn_params() {
        let p = LeConnParams::default().with_conn_interval(20, 10);
        assert_eq!(p.validate(), Err(HciStatusCode::UnacceptableConnectionParam));
        let p = LeConnParams::default()
            .with_conn_interval(80, 80)
            .with_supervision_timeout(10);
        assert_eq!(p.validate(), Err(HciStatusCode::UnacceptableConnectionParam));
        let p = LeConnParams {
            scan_window: 100,
            ..LeConnParams::default()
        };
        assert_eq!(p.validate(), Err(HciStatusCode::InvalidHciCommandParameters));
    }

    #[test]
    fn scan_and_adv_validation() {
        assert!(ScanParams::default().validate().is_ok());
        assert!(ScanParams::default().with_interval_window(16, 32).validate().is_err());
        assert!(AdvertisingParams::default().validate().is_ok());
        let bad = AdvertisingParams {
            channel_map: 0,
            ..AdvertisingParams::default()
        };
        assert!(bad.validate().is_err());
    }
}
