//! Replays recorded events through the [`TraceProcessor`] interface
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::native::etw_types::{OwnedEventRecord, TraceHandle};
use crate::native::evntrace::{
    EvntraceNativeError, EvntraceNativeResult, TraceCallbacks, TraceProcessor,
};

/// `ERROR_WMI_INSTANCE_NOT_FOUND`, returned by `OpenTrace` for sessions that do not exist
const ERROR_WMI_INSTANCE_NOT_FOUND: i32 = 4201;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Processing,
    Closed,
}

#[derive(Default)]
struct ReplayState {
    next_handle: TraceHandle,
    handles: HashMap<TraceHandle, HandleState>,
}

/// A [`TraceProcessor`] over pre-recorded records
///
/// Each trace name is bound to a list of records, delivered in order, `records_per_buffer` at a
/// time (the buffer callback is invoked after each batch, as ETW does after each buffer).
/// By default, processing returns once every record has been delivered. In live mode, it then
/// blocks until the trace is closed, just like a real-time session that has gone quiet.
pub struct ReplayProcessor {
    traces: HashMap<String, Arc<Vec<OwnedEventRecord>>>,
    records_per_buffer: usize,
    live: bool,
    state: Mutex<ReplayState>,
    closed: Condvar,
}

/// State of one opened replay
pub struct ReplaySession {
    handle: TraceHandle,
    records: Arc<Vec<OwnedEventRecord>>,
    callbacks: Arc<dyn TraceCallbacks>,
}

impl Default for ReplayProcessor {
    fn default() -> Self {
        Self {
            traces: HashMap::new(),
            records_per_buffer: 64,
            live: false,
            state: Mutex::new(ReplayState {
                next_handle: 1,
                handles: HashMap::new(),
            }),
            closed: Condvar::new(),
        }
    }
}

impl ReplayProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace(mut self, name: &str, records: Vec<OwnedEventRecord>) -> Self {
        self.traces.insert(name.to_owned(), Arc::new(records));
        self
    }

    pub fn records_per_buffer(mut self, records_per_buffer: usize) -> Self {
        self.records_per_buffer = records_per_buffer.max(1);
        self
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, ReplayState> {
        // The state is only made of plain values, a panic while holding the lock leaves it consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self, handle: TraceHandle) -> bool {
        self.lock_state().handles.get(&handle) == Some(&HandleState::Closed)
    }
}

impl TraceProcessor for ReplayProcessor {
    type Session = ReplaySession;

    fn open_trace(
        &self,
        name: &str,
        callbacks: Arc<dyn TraceCallbacks>,
    ) -> EvntraceNativeResult<(TraceHandle, ReplaySession)> {
        let records = self.traces.get(name).cloned().ok_or_else(|| {
            EvntraceNativeError::IoError(std::io::Error::from_raw_os_error(
                ERROR_WMI_INSTANCE_NOT_FOUND,
            ))
        })?;

        let mut state = self.lock_state();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, HandleState::Open);

        Ok((
            handle,
            ReplaySession {
                handle,
                records,
                callbacks,
            },
        ))
    }

    fn process_trace(&self, session: &mut ReplaySession) -> EvntraceNativeResult<()> {
        {
            let mut state = self.lock_state();
            match state.handles.get_mut(&session.handle) {
                Some(s) if *s == HandleState::Open => *s = HandleState::Processing,
                _ => return Err(EvntraceNativeError::InvalidHandle),
            }
        }

        let mut stopped = false;
        for buffer in session.records.chunks(self.records_per_buffer) {
            if self.is_closed(session.handle) {
                stopped = true;
                break;
            }
            for record in buffer {
                session.callbacks.on_event(record);
            }
            if !session.callbacks.on_buffer() {
                stopped = true;
                break;
            }
        }

        if self.live && !stopped {
            let mut state = self.lock_state();
            while state.handles.get(&session.handle) != Some(&HandleState::Closed) {
                state = self
                    .closed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }

        let mut state = self.lock_state();
        if let Some(s) = state.handles.get_mut(&session.handle) {
            if *s == HandleState::Processing {
                *s = HandleState::Open;
            }
        }
        Ok(())
    }

    fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()> {
        let mut state = self.lock_state();
        let previous = match state.handles.get_mut(&handle) {
            None | Some(HandleState::Closed) => return Err(EvntraceNativeError::InvalidHandle),
            Some(s) => std::mem::replace(s, HandleState::Closed),
        };
        drop(state);
        self.closed.notify_all();

        if previous == HandleState::Processing {
            // Like CloseTrace, the processing thread is still delivering buffers
            Err(EvntraceNativeError::ClosePending)
        } else {
            Ok(())
        }
    }
}
