//! Real-time consumer
//!
//! A [`Consumer`] opens one or several real-time traces, processes each of them on its own worker
//! thread, decodes every record it is handed and forwards the resulting [`Event`]s into a bounded
//! channel. The callback path never blocks: when the channel is full, the event is dropped and
//! accounted for (see [`Consumer::dropped_events`]).
//!
//! ```
//! use etwdecode::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
//! use etwdecode::native::memory::{MemoryTdh, PropertyDef, ReplayProcessor, SchemaBuilder};
//! use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
//! use etwdecode::trace::ConsumerBuilder;
//!
//! let provider = Guid::from_values(0x1234, 0, 0, [0; 8]);
//! let tdh = MemoryTdh::new().with_schema(
//!     SchemaBuilder::new(provider, EventDescriptor::default())
//!         .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull)),
//! );
//! let mut header = EventHeader::default();
//! header.provider_id = provider;
//! let replay = ReplayProcessor::new().with_trace(
//!     "my-session",
//!     vec![OwnedEventRecord::new(header, 4u32.to_le_bytes().to_vec())],
//! );
//!
//! let mut consumer = ConsumerBuilder::with_processor(replay)
//!     .trace_names(["my-session"])
//!     .backend(tdh)
//!     .build()
//!     .unwrap();
//! let events = consumer.events().unwrap();
//! consumer.start().unwrap();
//! consumer.wait();
//! consumer.stop().unwrap();
//!
//! let received: Vec<_> = events.iter().collect();
//! assert_eq!(received.len(), 1);
//! assert_eq!(received[0].event_data["Pid"], "4");
//! ```
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::decoder::{DecoderError, DefaultHooks, EventHooks};
use crate::event::Event;
use crate::native::etw_types::TraceHandle;
use crate::native::evntrace::{EvntraceNativeError, TraceProcessor};
use crate::native::tdh::TdhBackend;
use crate::property::PropertyError;

mod callback_data;

pub use callback_data::{CallbackData, LOST_EVENT_GUID};

/// Default capacity of the event channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Trace module errors
#[derive(Debug)]
pub enum TraceError {
    /// A trace could not be opened. Traces opened before it have been closed again
    OpenFailed {
        trace: String,
        source: EvntraceNativeError,
    },
    /// Processing a trace stopped on an error
    ProcessFailed {
        trace: String,
        source: EvntraceNativeError,
    },
    CloseFailed {
        trace: String,
        source: EvntraceNativeError,
    },
    /// A record could not be decoded, and has been dropped
    Decoder(DecoderError),
    /// A property of an event could not be formatted, and has been left empty
    Property(PropertyError),
    AlreadyStarted,
    /// No [`TdhBackend`] has been configured, and no default exists on this platform
    MissingBackend,
    /// Wrapper over an standard IO Error
    IoError(std::io::Error),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenFailed { trace, source } => write!(f, "unable to open trace {}: {}", trace, source),
            Self::ProcessFailed { trace, source } => {
                write!(f, "unable to process trace {}: {}", trace, source)
            }
            Self::CloseFailed { trace, source } => write!(f, "unable to close trace {}: {}", trace, source),
            Self::Decoder(e) => write!(f, "unable to decode record: {}", e),
            Self::Property(e) => write!(f, "{}", e),
            Self::AlreadyStarted => write!(f, "consumer already started"),
            Self::MissingBackend => write!(f, "no TDH backend available"),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OpenFailed { source, .. }
            | Self::ProcessFailed { source, .. }
            | Self::CloseFailed { source, .. } => Some(source),
            Self::Decoder(e) => Some(e),
            Self::Property(e) => Some(e),
            Self::IoError(e) => Some(e),
            Self::AlreadyStarted | Self::MissingBackend => None,
        }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        TraceError::IoError(err)
    }
}

impl From<DecoderError> for TraceError {
    fn from(err: DecoderError) -> Self {
        TraceError::Decoder(err)
    }
}

impl From<PropertyError> for TraceError {
    fn from(err: PropertyError) -> Self {
        TraceError::Property(err)
    }
}

pub type TraceResult<T> = Result<T, TraceError>;

/// State shared by a [`Consumer`] and the callbacks of all its traces
#[derive(Debug, Default)]
pub(crate) struct ConsumerState {
    cancelled: AtomicBool,
    lost: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    last_error: Mutex<Option<Arc<TraceError>>>,
}

impl ConsumerState {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn count_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Last writer wins
    pub(crate) fn record_error(&self, err: TraceError) {
        let mut slot = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(err));
    }

    fn last_error(&self) -> Option<Arc<TraceError>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Builds a [`Consumer`]
pub struct ConsumerBuilder<P: TraceProcessor> {
    processor: P,
    backend: Option<Arc<dyn TdhBackend>>,
    hooks: Arc<dyn EventHooks>,
    trace_names: Vec<String>,
    channel_capacity: usize,
}

#[cfg(windows)]
impl ConsumerBuilder<crate::native::evntrace::WindowsEtw> {
    /// A builder for a consumer of the real-time sessions of this machine
    pub fn new() -> Self {
        Self::with_processor(crate::native::evntrace::WindowsEtw)
    }
}

#[cfg(windows)]
impl Default for ConsumerBuilder<crate::native::evntrace::WindowsEtw> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TraceProcessor> ConsumerBuilder<P> {
    pub fn with_processor(processor: P) -> Self {
        Self {
            processor,
            backend: None,
            hooks: Arc::new(DefaultHooks),
            trace_names: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Replaces the [`TraceProcessor`], keeping everything else
    pub fn processor<Q: TraceProcessor>(self, processor: Q) -> ConsumerBuilder<Q> {
        ConsumerBuilder {
            processor,
            backend: self.backend,
            hooks: self.hooks,
            trace_names: self.trace_names,
            channel_capacity: self.channel_capacity,
        }
    }

    /// Names of the real-time sessions to consume
    pub fn trace_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trace_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Capacity of the event channel (at least 1)
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn hooks<H: EventHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn backend<B: TdhBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Shares a backend with other consumers (or with the caller)
    pub fn shared_backend(mut self, backend: Arc<dyn TdhBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> TraceResult<Consumer<P>> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => default_backend()?,
        };
        let (sender, receiver) = sync_channel(self.channel_capacity);

        Ok(Consumer {
            processor: Arc::new(self.processor),
            backend,
            hooks: self.hooks,
            trace_names: self.trace_names,
            state: Arc::new(ConsumerState::default()),
            sender: Some(sender),
            receiver: Some(receiver),
            handles: Vec::new(),
            workers: Vec::new(),
            started: false,
        })
    }
}

#[cfg(windows)]
fn default_backend() -> TraceResult<Arc<dyn TdhBackend>> {
    Ok(Arc::new(crate::native::tdh::WindowsTdh))
}

#[cfg(not(windows))]
fn default_backend() -> TraceResult<Arc<dyn TdhBackend>> {
    Err(TraceError::MissingBackend)
}

/// Decodes the events of real-time traces into a channel
///
/// Dropping a `Consumer` stops it.
pub struct Consumer<P: TraceProcessor> {
    processor: Arc<P>,
    backend: Arc<dyn TdhBackend>,
    hooks: Arc<dyn EventHooks>,
    trace_names: Vec<String>,
    state: Arc<ConsumerState>,
    /// Every trace callback holds a clone of this sender, so the channel only closes once all of
    /// them are gone as well
    sender: Option<SyncSender<Event>>,
    receiver: Option<Receiver<Event>>,
    handles: Vec<(String, TraceHandle)>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl<P: TraceProcessor> Consumer<P> {
    /// Opens every trace and starts processing them, each on its own thread
    ///
    /// If a trace cannot be opened, the ones opened before it are closed and nothing gets processed.
    pub fn start(&mut self) -> TraceResult<()> {
        if self.started {
            return Err(TraceError::AlreadyStarted);
        }
        let sender = match &self.sender {
            Some(sender) => sender.clone(),
            None => return Err(TraceError::AlreadyStarted),
        };
        self.started = true;

        let mut opened = Vec::with_capacity(self.trace_names.len());
        for name in &self.trace_names {
            let callbacks = Arc::new(CallbackData::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.hooks),
                sender.clone(),
                Arc::clone(&self.state),
            ));

            match self.processor.open_trace(name, callbacks) {
                Ok((handle, session)) => {
                    log::debug!("opened trace {} (handle {:#x})", name, handle);
                    opened.push((name.clone(), handle, session));
                }
                Err(source) => {
                    log::error!("unable to open trace {}: {}", name, source);
                    for (opened_name, handle, _) in opened {
                        if let Err(e) = self.processor.close_trace(handle) {
                            log::warn!("unable to close trace {}: {}", opened_name, e);
                        }
                    }
                    return Err(TraceError::OpenFailed {
                        trace: name.clone(),
                        source,
                    });
                }
            }
        }

        self.handles = opened
            .iter()
            .map(|(name, handle, _)| (name.clone(), *handle))
            .collect();
        for (name, _, session) in opened {
            match self.spawn_worker(name, session) {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    // Sessions not handed to a worker yet are dropped here, their handles are closed by stop()
                    log::error!("unable to spawn a worker thread: {}", e);
                    let _ = self.stop();
                    return Err(TraceError::IoError(e));
                }
            }
        }

        Ok(())
    }

    fn spawn_worker(&self, name: String, mut session: P::Session) -> std::io::Result<JoinHandle<()>> {
        let processor = Arc::clone(&self.processor);
        let state = Arc::clone(&self.state);

        std::thread::Builder::new()
            .name(format!("etw-{}", name))
            .spawn(move || {
                log::debug!("processing trace {}", name);
                if let Err(source) = processor.process_trace(&mut session) {
                    if state.is_cancelled() {
                        log::debug!("trace {} stopped: {}", name, source);
                    } else {
                        log::error!("unable to process trace {}: {}", name, source);
                        state.record_error(TraceError::ProcessFailed { trace: name.clone(), source });
                    }
                }
                log::debug!("done processing trace {}", name);
                // Dropping the session releases this trace's sender
                drop(session);
            })
    }

    /// Stops every trace and waits for their workers to exit
    ///
    /// Once this returns, the event channel is closed and readers see it end after the
    /// remaining events. Calling this more than once is a no-op.
    pub fn stop(&mut self) -> TraceResult<()> {
        self.state.cancel();

        let mut result = Ok(());
        for (name, handle) in self.handles.drain(..) {
            match self.processor.close_trace(handle) {
                Ok(()) | Err(EvntraceNativeError::ClosePending) => {}
                Err(source) => {
                    log::error!("unable to close trace {}: {}", name, source);
                    if result.is_ok() {
                        result = Err(TraceError::CloseFailed { trace: name, source });
                    }
                }
            }
        }

        self.join_workers();
        self.sender.take();
        result
    }

    /// Waits for every trace to be fully processed, without cancelling anything
    ///
    /// This returns once the processor has handed over its last record, which for a real-time
    /// session only happens after it has been closed from elsewhere. Call [`Consumer::stop`]
    /// afterwards to release the handles and close the event channel.
    pub fn wait(&mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("a trace worker panicked");
            }
        }
    }

    /// The receiving end of the event channel. Can only be taken once
    pub fn events(&mut self) -> Option<Receiver<Event>> {
        self.receiver.take()
    }

    pub fn last_error(&self) -> Option<Arc<TraceError>> {
        self.state.last_error()
    }

    /// Events the OS reported as lost
    pub fn lost_events(&self) -> u64 {
        self.state.lost.load(Ordering::Relaxed)
    }

    /// Events dropped because the channel was full
    pub fn dropped_events(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Events a hook decided to skip
    pub fn skipped_events(&self) -> u64 {
        self.state.skipped.load(Ordering::Relaxed)
    }

    pub fn trace_names(&self) -> &[String] {
        &self.trace_names
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.state.is_cancelled()
    }
}

impl<P: TraceProcessor> Drop for Consumer<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("error while stopping the consumer: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::{EventHeader, Guid, OwnedEventRecord};
    use crate::native::memory::{MemoryTdh, ReplayProcessor};

    fn lost_record() -> OwnedEventRecord {
        let mut header = EventHeader::default();
        header.provider_id = LOST_EVENT_GUID;
        OwnedEventRecord::new(header, Vec::new())
    }

    #[test]
    fn test_builder() {
        let builder = ConsumerBuilder::with_processor(ReplayProcessor::new())
            .trace_names(["a", "b"])
            .channel_capacity(0);
        assert_eq!(builder.channel_capacity, 1);

        let consumer = builder.backend(MemoryTdh::new()).build().unwrap();
        assert_eq!(consumer.trace_names(), &["a".to_owned(), "b".to_owned()]);
        assert!(!consumer.is_running());
    }

    #[test]
    fn test_lost_events() {
        let replay = ReplayProcessor::new().with_trace("t", vec![lost_record(), lost_record()]);
        let mut consumer = ConsumerBuilder::with_processor(replay)
            .trace_names(["t"])
            .backend(MemoryTdh::new())
            .build()
            .unwrap();
        let events = consumer.events().unwrap();

        consumer.start().unwrap();
        consumer.wait();
        consumer.stop().unwrap();

        assert_eq!(events.iter().count(), 0);
        assert_eq!(consumer.lost_events(), 2);
        assert!(consumer.last_error().is_none());
    }

    #[test]
    fn test_decode_failure_is_recorded() {
        let mut header = EventHeader::default();
        header.provider_id = Guid::from_values(1, 1, 1, [1; 8]);
        let replay = ReplayProcessor::new().with_trace("t", vec![OwnedEventRecord::new(header, Vec::new())]);
        let mut consumer = ConsumerBuilder::with_processor(replay)
            .trace_names(["t"])
            .backend(MemoryTdh::new())
            .build()
            .unwrap();
        let events = consumer.events().unwrap();

        consumer.start().unwrap();
        consumer.wait();
        consumer.stop().unwrap();

        assert_eq!(events.iter().count(), 0);
        assert_eq!(consumer.dropped_events(), 0);
        assert!(matches!(
            consumer.last_error().as_deref(),
            Some(TraceError::Decoder(DecoderError::Schema(_)))
        ));
    }

    #[test]
    fn test_start_twice() {
        let replay = ReplayProcessor::new().with_trace("t", Vec::new());
        let mut consumer = ConsumerBuilder::with_processor(replay)
            .trace_names(["t"])
            .backend(MemoryTdh::new())
            .build()
            .unwrap();

        consumer.start().unwrap();
        assert!(matches!(consumer.start(), Err(TraceError::AlreadyStarted)));
        consumer.stop().unwrap();
        consumer.stop().unwrap();
    }

    #[cfg(not(windows))]
    #[test]
    fn test_missing_backend() {
        let result = ConsumerBuilder::with_processor(ReplayProcessor::new()).build();
        assert!(matches!(result, Err(TraceError::MissingBackend)));
    }
}
