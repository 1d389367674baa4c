//! Native API - Event Tracing evntrace header
//!
//! The `evntrace` module is an abstraction layer for the consumer half of the Windows evntrace
//! library (`OpenTrace`, `ProcessTrace` and `CloseTrace`). The consumer drives it through the
//! [`TraceProcessor`] trait, and is driven back through [`TraceCallbacks`].
//!
//! This module shouldn't be accessed directly. Modules from the crate level provide a safe API to interact
//! with the crate
use std::sync::Arc;

use super::etw_types::{EventRecord, TraceHandle};

/// `ERROR_CTX_CLOSE_PENDING`
pub const ERROR_CTX_CLOSE_PENDING: u32 = 7007;

/// Evntrace native module errors
#[derive(Debug)]
pub enum EvntraceNativeError {
    /// Represents an Invalid Handle Error
    InvalidHandle,
    /// `CloseTrace` accepted the request, but the trace still has buffers to deliver
    ClosePending,
    /// Represents an standard IO Error
    IoError(std::io::Error),
}

impl std::fmt::Display for EvntraceNativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid trace handle"),
            Self::ClosePending => write!(f, "trace close is pending"),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EvntraceNativeError {}

impl From<std::io::Error> for EvntraceNativeError {
    fn from(err: std::io::Error) -> Self {
        EvntraceNativeError::IoError(err)
    }
}

impl EvntraceNativeError {
    pub(crate) fn from_status(status: u32) -> Self {
        match status {
            ERROR_CTX_CLOSE_PENDING => EvntraceNativeError::ClosePending,
            s => EvntraceNativeError::IoError(std::io::Error::from_raw_os_error(s as i32)),
        }
    }
}

pub type EvntraceNativeResult<T> = Result<T, EvntraceNativeError>;

/// What a trace calls back into while it is being processed
///
/// Both methods are invoked on the thread blocked in [`TraceProcessor::process_trace`].
pub trait TraceCallbacks: Send + Sync {
    /// Called once per delivered buffer. Returning `false` asks the trace to stop
    fn on_buffer(&self) -> bool;

    /// Called for every record. The record is only valid for the duration of the call
    fn on_event(&self, record: &EventRecord);
}

/// Opens, processes and closes real-time traces
///
/// Processing is blocking: [`TraceProcessor::process_trace`] only returns once the trace has been
/// closed (or its buffer callback asked to stop), so that the consumer runs it on its own thread.
pub trait TraceProcessor: Send + Sync + 'static {
    /// Per-trace state created by `open_trace` and moved to the processing thread
    type Session: Send + 'static;

    fn open_trace(
        &self,
        name: &str,
        callbacks: Arc<dyn TraceCallbacks>,
    ) -> EvntraceNativeResult<(TraceHandle, Self::Session)>;

    fn process_trace(&self, session: &mut Self::Session) -> EvntraceNativeResult<()>;

    /// May fail with [`EvntraceNativeError::ClosePending`], which callers should treat as a success
    fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()>;
}

#[cfg(windows)]
pub use self::windows_etw::{WindowsEtw, WindowsSession};

#[cfg(windows)]
mod windows_etw {
    use std::ffi::c_void;
    use std::panic::AssertUnwindSafe;

    use widestring::U16CString;
    use windows::core::PWSTR;
    use windows::Win32::System::Diagnostics::Etw;

    use super::*;
    use crate::native::etw_types::INVALID_TRACE_HANDLE;

    const PROCESS_TRACE_MODE_REAL_TIME: u32 = 0x0000_0100;
    const PROCESS_TRACE_MODE_EVENT_RECORD: u32 = 0x1000_0000;

    type Context = Arc<dyn TraceCallbacks>;

    /// Consumes real-time sessions through `advapi32.dll`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsEtw;

    /// Everything `OpenTraceW` keeps pointers to, kept alive until processing is over
    pub struct WindowsSession {
        handle: TraceHandle,
        _logfile: Box<Etw::EVENT_TRACE_LOGFILEW>,
        _logger_name: U16CString,
        _context: Box<Context>,
    }

    // Safety: the raw pointers in the log file only point into buffers owned by this session
    unsafe impl Send for WindowsSession {}

    unsafe fn context_of<'a>(p_context: *mut c_void) -> Option<&'a Context> {
        (p_context as *const Context).as_ref()
    }

    extern "system" fn event_record_thunk(p_record: *mut Etw::EVENT_RECORD) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| {
            let record_from_ptr = unsafe {
                // Safety: lifetime is valid at least until the end of the callback. A correct lifetime will be attached when we pass the reference to the child function
                EventRecord::from_ptr(p_record)
            };

            let user_context = unsafe {
                // Safety: the context was set by `open_trace` and lives as long as the session, which outlives processing
                p_record
                    .as_ref()
                    .and_then(|r| context_of(r.UserContext))
            };

            if let (Some(event_record), Some(user_context)) = (record_from_ptr, user_context) {
                user_context.on_event(event_record);
            }
        })) {
            Ok(_) => {}
            Err(e) => {
                log::error!("panic in event callback: {:?}", e);
                std::process::exit(1);
            }
        }
    }

    extern "system" fn buffer_thunk(p_logfile: *mut Etw::EVENT_TRACE_LOGFILEW) -> u32 {
        match std::panic::catch_unwind(AssertUnwindSafe(|| {
            let user_context = unsafe {
                // Safety: same as `event_record_thunk`
                p_logfile.as_ref().and_then(|l| context_of(l.Context))
            };
            user_context.map(|c| c.on_buffer()).unwrap_or(false)
        })) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                log::error!("panic in buffer callback: {:?}", e);
                std::process::exit(1);
            }
        }
    }

    impl TraceProcessor for WindowsEtw {
        type Session = WindowsSession;

        fn open_trace(
            &self,
            name: &str,
            callbacks: Arc<dyn TraceCallbacks>,
        ) -> EvntraceNativeResult<(TraceHandle, WindowsSession)> {
            let mut logger_name = U16CString::from_str_truncate(name);
            let context: Box<Context> = Box::new(callbacks);

            let mut logfile = Box::new(Etw::EVENT_TRACE_LOGFILEW::default());
            logfile.LoggerName = PWSTR(logger_name.as_mut_ptr());
            logfile.Anonymous1.ProcessTraceMode =
                PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
            logfile.Anonymous2.EventRecordCallback = Some(event_record_thunk);
            logfile.BufferCallback = Some(buffer_thunk);
            // That's kind-of fine because the user context is _not supposed_ to be changed by Windows APIs
            logfile.Context = context.as_ref() as *const Context as *mut c_void;

            let handle = unsafe {
                // Safety: every pointer in the log file points into buffers owned by the returned session
                Etw::OpenTraceW(logfile.as_mut() as *mut _)
            };

            if handle.Value == INVALID_TRACE_HANDLE {
                return Err(EvntraceNativeError::IoError(std::io::Error::last_os_error()));
            }

            Ok((
                handle.Value,
                WindowsSession {
                    handle: handle.Value,
                    _logfile: logfile,
                    _logger_name: logger_name,
                    _context: context,
                },
            ))
        }

        fn process_trace(&self, session: &mut WindowsSession) -> EvntraceNativeResult<()> {
            let handle = Etw::PROCESSTRACE_HANDLE {
                Value: session.handle,
            };
            let status = unsafe {
                // Safety: the handle is valid until `close_trace`, after which ProcessTrace returns
                Etw::ProcessTrace(&[handle], None, None)
            };
            match status.0 {
                0 => Ok(()),
                s => Err(EvntraceNativeError::from_status(s)),
            }
        }

        fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()> {
            if handle == INVALID_TRACE_HANDLE {
                return Err(EvntraceNativeError::InvalidHandle);
            }

            let status = unsafe {
                // Safety: the handle is valid
                Etw::CloseTrace(Etw::PROCESSTRACE_HANDLE { Value: handle })
            };
            match status.0 {
                0 => Ok(()),
                s => Err(EvntraceNativeError::from_status(s)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            EvntraceNativeError::from_status(ERROR_CTX_CLOSE_PENDING),
            EvntraceNativeError::ClosePending
        ));
        assert!(matches!(
            EvntraceNativeError::from_status(6),
            EvntraceNativeError::IoError(_)
        ));
    }
}
