//! rawbt HCI engine
//!
//! Raw HCI socket transport, the command/event engine and L2CAP fixed
//! channels. The runtime consumes this crate through [`HciHandler`] and the
//! [`ControllerProvider`] seam, which tests replace with a simulated
//! controller.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod error;
pub mod handler;
pub mod l2cap;
pub mod mgmt_event;
pub mod socket;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use error::{HciError, HciResult, L2capError};
pub use handler::{
    CallbackId, EventWaiter, HciCommandReply, HciHandler, LocalInfo, MgmtEventCallback,
};
pub use l2cap::{AclSink, L2capChannel, L2capServer};
pub use mgmt_event::{MgmtEvent, MgmtEventData, MgmtEventKind};
pub use socket::{
    ControllerProvider, HciSocket, HciTransport, IndexChange, IndexWatcher, LinuxControllers,
    MgmtIndexSocket, HCI_MAX_FRAME_SIZE,
};
