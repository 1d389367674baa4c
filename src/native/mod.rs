//! Abstraction layer for Native functions and types
//!
//! The decoding and consumption logic only ever talks to the [`tdh::TdhBackend`] and
//! [`evntrace::TraceProcessor`] traits. On Windows they are implemented over `tdh.dll` and
//! `advapi32.dll`, which is where every `unsafe` call of this crate lives; [`memory`] implements them
//! on any platform.
pub mod etw_types;
pub mod evntrace;
pub mod memory;
pub mod tdh;
pub mod tdh_types;
pub mod time;
