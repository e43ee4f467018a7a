//! GATT collaborator seam
//!
//! The GATT client lives outside this stack. Once a connection is secured the
//! device hands its ATT channel to the [`GattConnector`]; the returned session
//! is what makes the device ready.

use std::sync::Arc;

use async_trait::async_trait;
use rawbt_hci::L2capChannel;
use thiserror::Error;
use uuid::Uuid;

use crate::device::BtDevice;

#[derive(Debug, Error)]
pub enum GattError {
    #[error("ATT channel unavailable")]
    NoChannel,
    #[error("GATT setup failed: {0}")]
    Setup(String),
}

/// One discovered primary service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

/// Result of MTU exchange and service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattSession {
    pub mtu: u16,
    pub services: Vec<GattService>,
}

impl Default for GattSession {
    fn default() -> Self {
        Self {
            mtu: 23,
            services: Vec::new(),
        }
    }
}

#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Run GATT setup on the device's ATT channel
    async fn connect_gatt(
        &self,
        device: &Arc<BtDevice>,
        att: Option<L2capChannel>,
    ) -> Result<GattSession, GattError>;

    fn gatt_services(&self, device: &BtDevice) -> Vec<GattService> {
        device.gatt_session().map(|s| s.services).unwrap_or_default()
    }
}

/// Connector that completes immediately with the default MTU and no services
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGatt;

#[async_trait]
impl GattConnector for NoGatt {
    async fn connect_gatt(
        &self,
        _device: &Arc<BtDevice>,
        _att: Option<L2capChannel>,
    ) -> Result<GattSession, GattError> {
        Ok(GattSession::default())
    }
}
