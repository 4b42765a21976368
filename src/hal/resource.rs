use std::{panic::AssertUnwindSafe, sync::OnceLock};

use derive_more::{Deref, Display};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A completion token.
///
/// The work it tracks holds the sending half of a channel and drops it when done, so a
/// disconnected channel means completion. Clones observe the same completion.
#[derive(Debug, Default, Clone)]
pub struct Event(Option<flume::Receiver<()>>);

impl Event {
    /// An event that has already completed.
    #[inline]
    pub fn ready() -> Self {
        Self(None)
    }

    /// A pending event together with its signal; dropping the signal completes the event.
    pub fn pending() -> (EventSignal, Self) {
        let (sender, receiver) = flume::bounded(0);
        (EventSignal(sender), Self(Some(receiver)))
    }

    pub fn is_ready(&self) -> bool {
        match &self.0 {
            Some(receiver) => receiver.is_disconnected(),
            None => true,
        }
    }

    /// Blocks the calling thread until the event completes.
    pub fn wait(&self) {
        if let Some(receiver) = &self.0 {
            while receiver.recv().is_ok() {}
        }
    }

    pub async fn wait_async(&self) {
        if let Some(receiver) = &self.0 {
            while receiver.recv_async().await.is_ok() {}
        }
    }
}

/// Completes its [`Event`] when dropped.
#[derive(Debug)]
pub struct EventSignal(#[allow(unused)] flume::Sender<()>);

/// Identity of an execution resource, used to tell whether two handles share a queue.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    #[display("host")]
    Host,
    #[display("stream {_0}")]
    Stream(StreamId),
}

/// An execution resource that work is launched onto.
pub trait Resource: Clone + Send + Sync + 'static {
    /// The process-wide default handle.
    fn get_default() -> Self;
    fn key(&self) -> ResourceKey;
    /// An event completing once all work launched so far has completed.
    fn get_event(&self) -> Event;
    /// Blocks the host until all work launched so far has completed.
    fn wait(&self);
    /// Makes work launched after this call wait for `event`.
    fn wait_for(&self, event: &Event);
}

/// The calling thread. Work runs synchronously, so every event is complete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Host;

impl Resource for Host {
    #[inline]
    fn get_default() -> Self {
        Host
    }

    #[inline]
    fn key(&self) -> ResourceKey {
        ResourceKey::Host
    }

    #[inline]
    fn get_event(&self) -> Event {
        Event::ready()
    }

    #[inline]
    fn wait(&self) {}

    #[inline]
    fn wait_for(&self, event: &Event) {
        event.wait()
    }
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct StreamId(uid::Id<StreamId>);

enum StreamEvent {
    Launch(Box<dyn FnOnce() + Send>),
    Record(EventSignal),
    Wait(Event),
}

/// An in-order asynchronous queue served by a dedicated worker thread.
///
/// Launches return immediately; work runs on the worker in submission order. Clones share the
/// queue, and the worker exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Stream {
    id: StreamId,
    sender: flume::Sender<StreamEvent>,
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Stream {}

impl Stream {
    pub fn new() -> Result<Self, ResourceError> {
        let id = StreamId(uid::Id::new());
        let (sender, receiver) = flume::unbounded();
        std::thread::Builder::new()
            .name(format!("weft-stream-{id}"))
            .spawn(move || serve(id, receiver))?;
        Ok(Self { id, sender })
    }

    /// The process-wide default stream, spawned on first use.
    pub fn try_default() -> Result<Self, ResourceError> {
        static DEFAULT: OnceLock<Stream> = OnceLock::new();
        if let Some(stream) = DEFAULT.get() {
            return Ok(stream.clone());
        }
        // a racing caller may win; the loser's stream is dropped and its worker exits
        let stream = Stream::new()?;
        Ok(DEFAULT.get_or_init(|| stream).clone())
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queues `f` to run on the stream after everything queued before it.
    pub fn launch(&self, f: impl FnOnce() + Send + 'static) {
        if self.sender.send(StreamEvent::Launch(Box::new(f))).is_err() {
            log::error!("stream {} is closed, dropping launch", self.id);
        }
    }
}

impl Resource for Stream {
    /// # Panics
    /// If the default stream's worker thread cannot be spawned; see [`Stream::try_default`].
    fn get_default() -> Self {
        Stream::try_default().expect("failed to spawn default stream")
    }

    #[inline]
    fn key(&self) -> ResourceKey {
        ResourceKey::Stream(self.id)
    }

    fn get_event(&self) -> Event {
        let (signal, event) = Event::pending();
        // a closed stream drops the signal right here, completing the event
        _ = self.sender.send(StreamEvent::Record(signal));
        event
    }

    fn wait(&self) {
        self.get_event().wait()
    }

    fn wait_for(&self, event: &Event) {
        if event.is_ready() {
            return;
        }
        _ = self.sender.send(StreamEvent::Wait(event.clone()));
    }
}

/// Serves `receiver` until every sender is gone. A panicking launch is logged and skipped, so
/// later launches still run and recorded events still complete.
fn serve(id: StreamId, receiver: flume::Receiver<StreamEvent>) {
    while let Ok(event) = receiver.recv() {
        match event {
            StreamEvent::Launch(f) => {
                if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    log::error!("stream {id} launch panicked, continuing with the next one");
                }
            }
            StreamEvent::Record(signal) => drop(signal),
            StreamEvent::Wait(event) => event.wait(),
        }
    }
}
