//! Decoded events
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::native::etw_types::Guid;
use crate::native::time::FileTime;

static COMPUTER_NAME: Lazy<String> = Lazy::new(|| {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default()
});

/// Name of the machine the events are decoded on
pub fn computer_name() -> &'static str {
    &COMPUTER_NAME
}

/// System properties of an event, i.e. everything that does not come from its user data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub computer: String,
    pub process_id: u32,
    pub thread_id: u32,
    pub activity_id: Guid,
    pub related_activity_id: Option<Guid>,
    pub event_id: u16,
    pub version: u8,
    /// `<Class>/<Opcode>`, for MOF events only
    pub event_type: Option<String>,
    /// Class GUID, for MOF events only
    pub event_guid: Option<Guid>,
    pub channel: u8,
    pub channel_name: String,
    pub level: u8,
    pub level_name: String,
    pub opcode: u8,
    pub opcode_name: String,
    pub task: u16,
    pub task_name: String,
    pub keywords: u64,
    pub keywords_name: String,
    pub provider_guid: Guid,
    pub provider_name: String,
    pub timestamp: FileTime,
}

/// A decoded ETW event
///
/// Scalar properties land in `event_data`, or in `user_data` when the event uses a user-data
/// template. Arrays and structures have their own maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub event_data: HashMap<String, String>,
    pub user_data: HashMap<String, String>,
    pub event_data_arrays: HashMap<String, Vec<String>>,
    pub event_data_structs: Vec<HashMap<String, String>>,
    pub user_data_template: bool,
    /// Set by the hooks for events that can be discarded under pressure
    pub skippable: bool,
    pub system: EventMetadata,
}

impl Event {
    /// A scalar property, wherever it was routed
    pub fn property(&self, name: &str) -> Option<&str> {
        let data = if self.user_data_template {
            &self.user_data
        } else {
            &self.event_data
        };
        data.get(name).map(String::as_str)
    }
}
