use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::core::device::{DeviceId, LayoutType};
use crate::core::namespace::FileHandle;
use crate::core::state::StateId;
use crate::core::transfer::{IoMode, Subject};

/// Length value meaning "to the end of the file".
pub const NFS4_UINT64_MAX: u64 = u64::MAX;

/// Who is calling and over which connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub subject: Subject,
    pub remote: SocketAddr,
    /// Door address the client connected to.
    pub local: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSegment {
    pub layout_type: LayoutType,
    pub device_id: DeviceId,
    pub iomode: IoMode,
    pub offset: u64,
    pub length: u64,
    pub stripe_unit: u32,
    pub file_handle: FileHandle,
}

impl LayoutSegment {
    /// Whole-file segment on `device_id`.
    pub fn whole_file(device_id: DeviceId, stripe_unit: u32, fh: FileHandle, iomode: IoMode) -> Self {
        Self {
            layout_type: LayoutType::NfsV41Files,
            device_id,
            iomode,
            offset: 0,
            length: NFS4_UINT64_MAX,
            stripe_unit,
            file_handle: fh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub return_on_close: bool,
    /// Layout state id, distinct from the I/O state it was granted for.
    pub state_id: StateId,
    pub segments: Vec<LayoutSegment>,
}
