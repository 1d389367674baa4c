//! Integrates with [serde](https://serde.rs/) enabling [`Event`]s to be serialized to various formats.
//!
//! Requires the `serde` feature be enabled.
//!
//! If the `time_rs` feature is enabled, then time stamps are serialized per the serialization format
//! of the time crate. Otherwise, if `time_rs` is not enabled, then timestamps are serialized as 64bit
//! unix timestamps (in milliseconds).
//!
//! ```
//! use etwdecode::event::Event;
//! use etwdecode::ser::{EventSerializer, EventSerializerOptions};
//! extern crate serde_json;
//!
//! let mut event = Event::default();
//! event.event_data.insert("Pid".to_string(), "4".to_string());
//!
//! // `Event` implements `Serialize` directly; use an `EventSerializer` to tweak the output
//! let ser = EventSerializer::new(&event, EventSerializerOptions { include_system: false, ..Default::default() });
//! let json = serde_json::to_value(ser).unwrap();
//! assert_eq!(json["EventData"]["Pid"], "4");
//! assert!(json.get("System").is_none());
//! ```
#![cfg(feature = "serde")]

use serde::ser::{Serialize, SerializeStruct};

use crate::event::{Event, EventMetadata};
use crate::native::etw_types::Guid;

/// Serialization options for EventSerializer
#[derive(Debug, Clone, Copy)]
pub struct EventSerializerOptions {
    /// Includes the [`EventMetadata`] in the serialized output
    pub include_system: bool,
    /// Includes empty property maps (e.g. `UserData` for events that do not use it)
    pub include_empty: bool,
}

impl Default for EventSerializerOptions {
    fn default() -> Self {
        Self {
            include_system: true,
            include_empty: false,
        }
    }
}

/// Used to serialize an [`Event`] using [serde](https://serde.rs/)
pub struct EventSerializer<'a> {
    event: &'a Event,
    options: EventSerializerOptions,
}

impl<'a> EventSerializer<'a> {
    pub fn new(event: &'a Event, options: EventSerializerOptions) -> Self {
        Self { event, options }
    }
}

impl Serialize for EventSerializer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let event = self.event;
        let mut state = serializer.serialize_struct("Event", 5)?;

        if self.options.include_system {
            state.serialize_field("System", &MetadataSer(&event.system))?;
        } else {
            state.skip_field("System")?;
        }

        let include_empty = self.options.include_empty;
        macro_rules! field {
            ($name:literal, $value:expr) => {
                if include_empty || !$value.is_empty() {
                    state.serialize_field($name, &$value)?;
                } else {
                    state.skip_field($name)?;
                }
            };
        }

        field!("EventData", event.event_data);
        field!("UserData", event.user_data);
        field!("EventDataArrays", event.event_data_arrays);
        field!("EventDataStructs", event.event_data_structs);

        state.end()
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        EventSerializer::new(self, Default::default()).serialize(serializer)
    }
}

impl Serialize for EventMetadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        MetadataSer(self).serialize(serializer)
    }
}

impl Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            return serializer.collect_str(self);
        }

        (self.data1, self.data2, self.data3, self.data4).serialize(serializer)
    }
}

struct MetadataSer<'a>(&'a EventMetadata);

impl Serialize for MetadataSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let m = self.0;
        let mut state = serializer.serialize_struct("System", 17)?;
        state.serialize_field("Computer", &m.computer)?;
        state.serialize_field("Execution", &ExecutionSer(m))?;
        state.serialize_field("EventID", &m.event_id)?;
        state.serialize_field("Version", &m.version)?;

        match &m.event_type {
            Some(event_type) => state.serialize_field("EventType", event_type)?,
            None => state.skip_field("EventType")?,
        }
        match &m.event_guid {
            Some(guid) => state.serialize_field("EventGuid", guid)?,
            None => state.skip_field("EventGuid")?,
        }

        state.serialize_field("Correlation", &CorrelationSer(m))?;
        state.serialize_field("Provider", &ProviderSer(m))?;
        state.serialize_field("Channel", &m.channel_name)?;
        state.serialize_field("Level", &NamedValue(m.level as u64, &m.level_name))?;
        state.serialize_field("Opcode", &NamedValue(m.opcode as u64, &m.opcode_name))?;
        state.serialize_field("Task", &NamedValue(m.task as u64, &m.task_name))?;
        state.serialize_field("Keywords", &NamedValue(m.keywords, &m.keywords_name))?;
        state.serialize_field("TimeCreated", &m.timestamp)?;
        state.end()
    }
}

struct ExecutionSer<'a>(&'a EventMetadata);

impl Serialize for ExecutionSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Execution", 2)?;
        state.serialize_field("ProcessID", &self.0.process_id)?;
        state.serialize_field("ThreadID", &self.0.thread_id)?;
        state.end()
    }
}

struct CorrelationSer<'a>(&'a EventMetadata);

impl Serialize for CorrelationSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Correlation", 2)?;
        state.serialize_field("ActivityID", &self.0.activity_id)?;
        match &self.0.related_activity_id {
            Some(guid) => state.serialize_field("RelatedActivityID", guid)?,
            None => state.skip_field("RelatedActivityID")?,
        }
        state.end()
    }
}

struct ProviderSer<'a>(&'a EventMetadata);

impl Serialize for ProviderSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Provider", 2)?;
        state.serialize_field("Guid", &self.0.provider_guid)?;
        state.serialize_field("Name", &self.0.provider_name)?;
        state.end()
    }
}

struct NamedValue<'a>(u64, &'a str);

impl Serialize for NamedValue<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("NamedValue", 2)?;
        state.serialize_field("Value", &self.0)?;
        state.serialize_field("Name", self.1)?;
        state.end()
    }
}
