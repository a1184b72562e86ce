pub mod allocator;
pub mod device;
pub mod ledger;
pub mod messaging;
pub mod namespace;
pub mod notifications;
pub mod orchestrator;
pub mod registry;
pub mod selection;
pub mod state;
pub mod transfer;

pub use device::{Device, DeviceAddr, DeviceId, LayoutType, MDS_DEVICE_ID};
pub use ledger::TransferLedger;
pub use messaging::{CellPath, DoorEvent, DoorMessage, MessageBus, PoolReady, TransferFinished};
pub use orchestrator::Orchestrator;
pub use registry::DeviceRegistry;
pub use selection::{PoolSelector, RetryPolicy, SelectionError};
pub use state::{StateHandler, StateId};
pub use transfer::{IoMode, Subject, Transfer, TransferState};
