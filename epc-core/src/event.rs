//! Enclave Lifecycle Events - Inbound Wire Format
//!
//! The kernel-side tracer emits one fixed-size record per enclave lifecycle
//! change.  This module defines the C-layout record as it arrives from the
//! ring buffer and the validated [`EnclaveLifecycleEvent`] the aggregator
//! consumes.
//!
//! # Record layout (native endian, 40 bytes):
//! ```text
//! 0        8        16      20      24       32       40
//! | cgroup | pid    | action| pad   | len    | encl   |
//! ```

use crate::error::{AccountingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;

/// Lifecycle action reported by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Enclave created or initialized; `bytes` is the EPC it pins.
    Create = 0,
    /// Owning task exited or must rebuild its enclave; release everything.
    Delete = 1,
}

impl Action {
    /// Map a raw action tag to an [`Action`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::Create),
            1 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Event record exactly as written by the kernel tracer.
///
/// This struct maps directly to the C ABI layout of the ring buffer entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawEnclaveEvent {
    /// cgroup id of the enclave owner
    pub cgroup_id: u64,
    /// Task (process) id
    pub pid: u64,
    /// Action tag (0 = CREATE, 1 = DELETE)
    pub action: i32,
    /// Enclave size in bytes, zero for DELETE
    pub len: u64,
    /// Kernel enclave pointer, diagnostic only
    pub encl: u64,
}

/// Size of one raw record on the wire.
pub const RAW_EVENT_SIZE: usize = size_of::<RawEnclaveEvent>();

impl RawEnclaveEvent {
    /// Decode a record from the first [`RAW_EVENT_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RAW_EVENT_SIZE {
            return Err(AccountingError::TruncatedRecord {
                len: buf.len(),
                expected: RAW_EVENT_SIZE,
            });
        }

        let u64_at = |off: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[off..off + 8]);
            u64::from_ne_bytes(word)
        };
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&buf[16..20]);

        Ok(Self {
            cgroup_id: u64_at(0),
            pid: u64_at(8),
            action: i32::from_ne_bytes(tag),
            len: u64_at(24),
            encl: u64_at(32),
        })
    }

    /// Encode into the wire layout (padding bytes are zero).
    pub fn encode(&self) -> [u8; RAW_EVENT_SIZE] {
        let mut buf = [0u8; RAW_EVENT_SIZE];
        buf[0..8].copy_from_slice(&self.cgroup_id.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.pid.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.action.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.len.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.encl.to_ne_bytes());
        buf
    }
}

/// A validated enclave lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveLifecycleEvent {
    /// Container (cgroup) id of the owning task
    pub container_id: u64,
    /// Owning task id
    pub task_id: u64,
    /// What happened
    pub action: Action,
    /// EPC bytes for CREATE; always zero for DELETE
    pub bytes: u64,
    /// Opaque diagnostic handle, never used in accounting
    pub handle: u64,
}

impl EnclaveLifecycleEvent {
    /// Build a CREATE event.
    pub fn create(container_id: u64, task_id: u64, bytes: u64) -> Self {
        Self {
            container_id,
            task_id,
            action: Action::Create,
            bytes,
            handle: 0,
        }
    }

    /// Build a length-less DELETE event.
    pub fn delete(container_id: u64, task_id: u64) -> Self {
        Self {
            container_id,
            task_id,
            action: Action::Delete,
            bytes: 0,
            handle: 0,
        }
    }

    /// Attach the kernel's diagnostic handle.
    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = handle;
        self
    }
}

impl TryFrom<RawEnclaveEvent> for EnclaveLifecycleEvent {
    type Error = AccountingError;

    fn try_from(raw: RawEnclaveEvent) -> Result<Self> {
        let action = Action::from_tag(raw.action).ok_or(AccountingError::UnknownAction {
            tag: raw.action,
            container_id: raw.cgroup_id,
            task_id: raw.pid,
        })?;

        // A DELETE always releases the whole task total; drop any stray length.
        let bytes = match action {
            Action::Create => raw.len,
            Action::Delete => 0,
        };

        Ok(Self {
            container_id: raw.cgroup_id,
            task_id: raw.pid,
            action,
            bytes,
            handle: raw.encl,
        })
    }
}

impl From<&EnclaveLifecycleEvent> for RawEnclaveEvent {
    fn from(event: &EnclaveLifecycleEvent) -> Self {
        Self {
            cgroup_id: event.container_id,
            pid: event.task_id,
            action: event.action as i32,
            len: event.bytes,
            encl: event.handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_layout_size() {
        assert_eq!(RAW_EVENT_SIZE, 40);
    }

    #[test]
    fn test_decode_create_record() {
        let raw = RawEnclaveEvent {
            cgroup_id: 4242,
            pid: 17,
            action: 0,
            len: 8 * 4096,
            encl: 0xdead_beef,
        };
        let decoded = RawEnclaveEvent::decode(&raw.encode()).unwrap();
        assert_eq!(decoded, raw);

        let event = EnclaveLifecycleEvent::try_from(decoded).unwrap();
        assert_eq!(event.action, Action::Create);
        assert_eq!(event.bytes, 8 * 4096);
        assert_eq!(event.handle, 0xdead_beef);
    }

    #[test]
    fn test_delete_ignores_length() {
        let raw = RawEnclaveEvent {
            cgroup_id: 1,
            pid: 2,
            action: 1,
            len: 999,
            encl: 0,
        };
        let event = EnclaveLifecycleEvent::try_from(raw).unwrap();
        assert_eq!(event, EnclaveLifecycleEvent::delete(1, 2));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let raw = RawEnclaveEvent {
            action: 5,
            ..Default::default()
        };
        let err = EnclaveLifecycleEvent::try_from(raw).unwrap_err();
        assert!(matches!(err, AccountingError::UnknownAction { tag: 5, .. }));
    }

    #[test]
    fn test_truncated_record() {
        let err = RawEnclaveEvent::decode(&[0u8; 12]).unwrap_err();
        assert!(matches!(
            err,
            AccountingError::TruncatedRecord { len: 12, expected: 40 }
        ));
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Create.to_string(), "create");
        assert_eq!(Action::Delete.to_string(), "delete");
        assert_eq!(Action::from_tag(1), Some(Action::Delete));
        assert_eq!(Action::from_tag(-1), None);
    }
}
