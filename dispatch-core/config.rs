use std::path::PathBuf;

use crate::event::EventKind;

/// Bitmask of queue-management notifications a queue wants to receive.
/// Kept as a small hand-rolled bitset rather than pulling in a flags crate
/// for four bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagementEvents(u8);

impl ManagementEvents {
    pub const NONE: ManagementEvents = ManagementEvents(0);
    pub const PSTARTUP: ManagementEvents = ManagementEvents(1 << 0);
    pub const DONE: ManagementEvents = ManagementEvents(1 << 1);
    pub const PDIED: ManagementEvents = ManagementEvents(1 << 2);
    pub const WSTARTUP: ManagementEvents = ManagementEvents(1 << 3);

    pub fn insert(&mut self, other: ManagementEvents) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: ManagementEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn from_name(name: &str) -> Option<ManagementEvents> {
        match name {
            "QMAN_PSTARTUP" => Some(ManagementEvents::PSTARTUP),
            "QMAN_DONE" => Some(ManagementEvents::DONE),
            "QMAN_PDIED" => Some(ManagementEvents::PDIED),
            "QMAN_WSTARTUP" => Some(ManagementEvents::WSTARTUP),
            _ => None,
        }
    }

    /// Parses the comma-separated `managementEvents` config value.
    pub fn parse_list(value: &str) -> ManagementEvents {
        let mut events = ManagementEvents::NONE;
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(flag) = ManagementEvents::from_name(name) {
                events.insert(flag);
            } else {
                tracing::warn!(name, "unrecognised managementEvents entry");
            }
        }
        events
    }
}

/// Which scheduling policy a queue uses. A `Batch` queue is just a
/// `Straight` queue whose descriptor sets `num_sub_queues > 0`, per §6:
/// "a batch variant is activated by numSubQueues > 0".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Straight,
    Collection,
}

pub const DEF_NUM_QUEUE_WORKERS: u32 = 4;
pub const DEF_MAX_QUEUE_LEN: u32 = 1000;
pub const MAX_SUBQUEUES: u32 = 5;
pub const DEF_NUM_SUBQUEUES: u32 = 2;
pub const DEF_NUM_EVENTS_IN_SEQ_FROM_MAIN_QUEUE: u32 = 3;
pub const DEF_NUM_EVENTS_IN_SEQ_FROM_SUB_QUEUE: u32 = 2;

/// Immutable configuration read at container construction. See spec §3
/// "Queue descriptor".
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    pub name: String,
    pub key: String,
    pub queue_type: QueueType,
    pub max_length: u32,
    pub max_exec_time: Option<u64>,
    pub num_workers: u32,
    pub persistent_app: Option<PathBuf>,
    pub default_script: Option<String>,
    pub default_url: Option<String>,
    pub error_queue: Option<String>,
    pub parse_response_for_object: bool,
    pub run_priviledged: bool,
    pub blocking_worker_socket: bool,
    pub management_queue: Option<String>,
    pub management_event_type: Option<EventKind>,
    pub management_events: ManagementEvents,

    /// `Some` activates batch scheduling (§6: numSubQueues > 0).
    pub num_sub_queues: Option<u32>,
    pub max_events_from_main_queue: u32,
    pub max_events_from_sub_queue: u32,
}

impl QueueDescriptor {
    pub fn straight(name: impl Into<String>) -> Self {
        let name = name.into();
        QueueDescriptor {
            key: format!("queues.{}.", name),
            name,
            queue_type: QueueType::Straight,
            max_length: DEF_MAX_QUEUE_LEN,
            max_exec_time: None,
            num_workers: DEF_NUM_QUEUE_WORKERS,
            persistent_app: None,
            default_script: None,
            default_url: None,
            error_queue: None,
            parse_response_for_object: true,
            run_priviledged: false,
            blocking_worker_socket: false,
            management_queue: None,
            management_event_type: None,
            management_events: ManagementEvents::NONE,
            num_sub_queues: None,
            max_events_from_main_queue: DEF_NUM_EVENTS_IN_SEQ_FROM_MAIN_QUEUE,
            max_events_from_sub_queue: DEF_NUM_EVENTS_IN_SEQ_FROM_SUB_QUEUE,
        }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        QueueDescriptor {
            queue_type: QueueType::Collection,
            ..QueueDescriptor::straight(name)
        }
    }

    pub fn is_batch(&self) -> bool {
        self.num_sub_queues.map(|n| n > 0).unwrap_or(false)
    }
}

/// Global `[nucleus]` keys (§6).
#[derive(Debug, Clone)]
pub struct NucleusConfig {
    pub active_queues: Vec<String>,
    pub maint_interval: std::time::Duration,
    pub expired_event_interval: std::time::Duration,
    pub max_num_queues: u32,
    pub max_network_descriptors: u32,
    pub stats_dir: PathBuf,
    pub unix_socket_path: PathBuf,
    pub unix_socket_stream_path: PathBuf,
    pub socket_group: Option<String>,
}
