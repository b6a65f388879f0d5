//! JSON-RPC 2.0 transport client for the SQL Tools Service.
//!
//! `JsonRpcClient` is the only writer and the only reader of the engine's
//! byte streams. A single background thread decodes incoming frames and
//! routes each one to the channel of the request it belongs to. Callers poll
//! their request's channel without blocking.
//!
//! # Routing
//!
//! - Replies (`id` + `result`/`error`) go to the request with that id.
//! - A direct result carrying `operationId` binds that engine operation to
//!   the request. Later notifications with the same `params.operationId`
//!   go to the bound request.
//! - Notifications for an operation that is not bound yet are held until its
//!   direct result arrives. Notifications with no operation id are dropped.

use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::jsonrpc::framing::{self, FrameDecoder, FramingError};

/// Identifier of one logical request. Zero is never a valid id.
pub type RequestId = u64;

/// Default time `shutdown` waits for the reader thread to exit.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on notifications held for operations that are not bound yet.
pub const MAX_HELD_NOTIFICATIONS: usize = 256;

/// Lifecycle of a [`JsonRpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Streams are owned but the reader has not been spawned.
    Created,
    /// The reader is running and requests may be submitted.
    Running,
    /// Shutdown was requested; the reader is being stopped.
    ShuttingDown,
    /// The reader has exited or was detached. Terminal.
    Stopped,
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client is not in the state the call requires.
    #[error("JSON-RPC client is not running (state: {0:?})")]
    NotRunning(ClientState),

    /// Request id 0 is reserved as an invalid sentinel.
    #[error("Request id 0 is not a valid request id")]
    InvalidRequestId,

    /// A request with this id is already in flight.
    #[error("Request {0} is already in flight")]
    DuplicateRequest(RequestId),

    /// Submitted without a method name.
    #[error("Request method name must not be empty")]
    EmptyMethod,

    /// The request has already been sent once.
    #[error("Request {0} has already been executed")]
    AlreadyExecuted(RequestId),

    /// The id was never submitted or has already been released.
    #[error("Request {0} is not registered with the client")]
    UnknownRequest(RequestId),

    /// Encoding failure on the outbound side.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Failure writing to the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response reader has exited; no further messages will arrive.
    #[error("Response reader stopped: {0}")]
    ReaderStopped(String),
}

/// Routing table shared between callers and the reader thread.
struct Routes {
    state: ClientState,
    pending: HashMap<RequestId, Sender<Value>>,
    /// Engine operation id -> request id, learned from direct results.
    operations: HashMap<String, RequestId>,
    /// Notifications that arrived before their operation was bound.
    held: VecDeque<(String, Value)>,
    failure: Option<String>,
}

impl Routes {
    fn new() -> Self {
        Self {
            state: ClientState::Created,
            pending: HashMap::new(),
            operations: HashMap::new(),
            held: VecDeque::new(),
            failure: None,
        }
    }

    /// Deliver one decoded frame to its destination queue.
    fn dispatch(&mut self, message: Value) {
        if let Some(id) = reply_id(&message) {
            let operation = result_operation(&message);
            self.deliver(id, message);

            if let Some(operation) = operation {
                if self.pending.contains_key(&id) {
                    debug!("Request {} is engine operation {}", id, operation);
                    self.operations.insert(operation.clone(), id);
                    self.release_held(&operation, id);
                }
            }
            return;
        }

        let Some(operation) = notification_operation(&message) else {
            debug!(
                "Dropping notification without an operation id: {}",
                message.get("method").unwrap_or(&serde_json::Value::Null)
            );
            return;
        };

        if let Some(&id) = self.operations.get(&operation) {
            self.deliver(id, message);
            return;
        }

        // Operation ids that are request ids address the request directly.
        match parse_request_id(&operation) {
            Some(id) if self.pending.contains_key(&id) => self.deliver(id, message),
            _ => self.hold(operation, message),
        }
    }

    fn deliver(&mut self, id: RequestId, message: Value) {
        match self.pending.get(&id) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("Receiver for request {} is gone, releasing it", id);
                    self.release(id);
                }
            }
            None => warn!("Dropping message for unknown request {}", id),
        }
    }

    fn hold(&mut self, operation: String, message: Value) {
        if self.held.len() >= MAX_HELD_NOTIFICATIONS {
            if let Some((dropped, _)) = self.held.pop_front() {
                warn!("Dropping held notification for engine operation {}", dropped);
            }
        }
        debug!("Holding notification for unbound engine operation {}", operation);
        self.held.push_back((operation, message));
    }

    /// Forward notifications held for `operation`, in arrival order.
    fn release_held(&mut self, operation: &str, id: RequestId) {
        let (ready, rest): (VecDeque<_>, VecDeque<_>) = self
            .held
            .drain(..)
            .partition(|(held_for, _)| held_for == operation);
        self.held = rest;

        for (_, message) in ready {
            self.deliver(id, message);
        }
    }

    /// Forget the request's queue and every operation bound to it.
    fn release(&mut self, id: RequestId) {
        self.pending.remove(&id);
        self.operations.retain(|_, bound| *bound != id);
    }

    /// Transition to Stopped and hang up every queue.
    fn stop(&mut self) {
        self.state = ClientState::Stopped;
        self.pending.clear();
        self.operations.clear();
        self.held.clear();
    }
}

/// Id of a reply (`{"id": .., "result"|"error": ..}`) or an id-carrying call.
fn reply_id(message: &Value) -> Option<RequestId> {
    match message.get("id")? {
        Value::Null => None,
        Value::Number(n) => Some(n.as_u64().unwrap_or(0)),
        Value::String(s) => Some(parse_request_id(s).unwrap_or(0)),
        _ => Some(0),
    }
}

/// Engine operation id carried by a direct result.
fn result_operation(message: &Value) -> Option<String> {
    message
        .get("result")
        .and_then(|result| result.get("operationId"))
        .and_then(operation_key)
}

/// Engine operation id named by a notification's `params.operationId`.
fn notification_operation(message: &Value) -> Option<String> {
    message
        .get("params")
        .and_then(|params| params.get("operationId"))
        .and_then(operation_key)
}

fn operation_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_request_id(text: &str) -> Option<RequestId> {
    text.parse().ok().filter(|id| *id != 0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Inbound = Box<dyn Read + Send>;
type Outbound = Box<dyn Write + Send>;

/// Background reader plus the channel it signals on when it exits.
struct ReaderHandle {
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

/// JSON-RPC client bridging one background reader and many logical requests.
///
/// # Lifecycle
///
/// - `new()` - Take ownership of the streams (`Created`)
/// - `start()` - Spawn the reader thread (`Running`)
/// - `submit_request()` / `get_response()` / `request_finished()`
/// - `shutdown()` - Close the outbound stream and stop the reader (`Stopped`)
///
/// # Example
///
/// ```ignore
/// let client = JsonRpcClient::new(child_stdin, child_stdout);
/// client.start()?;
/// client.submit_request("scripting/script", params, 1)?;
/// while let Ok(None) = client.get_response(1) {
///     std::thread::sleep(Duration::from_millis(50));
/// }
/// ```
pub struct JsonRpcClient {
    routes: Arc<Mutex<Routes>>,
    writer: Mutex<Option<Outbound>>,
    reader: Mutex<Option<Inbound>>,
    reader_thread: Mutex<Option<ReaderHandle>>,
    receivers: Mutex<HashMap<RequestId, Receiver<Value>>>,
    shutdown_grace: Duration,
}

impl JsonRpcClient {
    /// Create a client over an outbound (requests) and inbound (responses) stream.
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        Self {
            routes: Arc::new(Mutex::new(Routes::new())),
            writer: Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(Box::new(reader))),
            reader_thread: Mutex::new(None),
            receivers: Mutex::new(HashMap::new()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set how long `shutdown` waits for the reader before detaching it.
    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.shutdown_grace = grace;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        lock(&self.routes).state
    }

    /// Spawn the background reader.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotRunning` unless the client is `Created`,
    /// or `TransportError::Io` if the thread cannot be spawned.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut routes = lock(&self.routes);
        if routes.state != ClientState::Created {
            return Err(TransportError::NotRunning(routes.state));
        }

        let inbound = lock(&self.reader)
            .take()
            .ok_or(TransportError::NotRunning(routes.state))?;
        let shared = Arc::clone(&self.routes);
        let (exit_tx, exit_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("jsonrpc-reader".to_string())
            .spawn(move || {
                reader_loop(inbound, shared);
                if exit_tx.send(()).is_err() {
                    debug!("No one is waiting for the JSON-RPC reader to exit");
                }
            })?;

        *lock(&self.reader_thread) = Some(ReaderHandle {
            thread,
            exited: exit_rx,
        });
        routes.state = ClientState::Running;
        info!("JSON-RPC client started");
        Ok(())
    }

    /// Register `id` and write one request frame.
    ///
    /// The response queue is registered before the frame is written, so a
    /// fast reply can never overtake its own registration. Concurrent calls
    /// are serialized on the writer; frames never interleave.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is 0 or already in flight, the method is
    /// empty, the client is not `Running`, or the write fails. On a write
    /// failure the registration is rolled back.
    pub fn submit_request(
        &self,
        method: &str,
        params: Value,
        id: RequestId,
    ) -> Result<(), TransportError> {
        if id == 0 {
            return Err(TransportError::InvalidRequestId);
        }
        if method.is_empty() {
            return Err(TransportError::EmptyMethod);
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut routes = lock(&self.routes);
            if routes.state != ClientState::Running {
                return Err(TransportError::NotRunning(routes.state));
            }
            if routes.pending.contains_key(&id) {
                return Err(TransportError::DuplicateRequest(id));
            }
            routes.pending.insert(id, tx);
        }
        lock(&self.receivers).insert(id, rx);

        if let Err(e) = self.write_request(method, &params, id) {
            warn!("Failed to submit request {}: {}", id, e);
            self.request_finished(id);
            return Err(e);
        }

        debug!("Submitted request {} ({})", id, method);
        Ok(())
    }

    fn write_request(&self, method: &str, params: &Value, id: RequestId) -> Result<(), TransportError> {
        let frame = framing::encode_request(method, params, id)?;

        let mut writer = lock(&self.writer);
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotRunning(self.state()));
        };
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }

    /// Pop the next message for `id` without blocking.
    ///
    /// Returns `Ok(None)` if nothing has arrived yet.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownRequest` for ids that are not
    /// registered, and `TransportError::ReaderStopped` once the reader has
    /// exited and every queued message has been consumed.
    pub fn get_response(&self, id: RequestId) -> Result<Option<Value>, TransportError> {
        let next = {
            let receivers = lock(&self.receivers);
            let rx = receivers
                .get(&id)
                .ok_or(TransportError::UnknownRequest(id))?;
            rx.try_recv()
        };

        match next {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.stopped_error()),
        }
    }

    fn stopped_error(&self) -> TransportError {
        let detail = lock(&self.routes)
            .failure
            .clone()
            .unwrap_or_else(|| "response stream closed".to_string());
        TransportError::ReaderStopped(detail)
    }

    /// Release the queue for `id` and unbind its engine operation. Later
    /// frames addressed to either are no longer delivered.
    pub fn request_finished(&self, id: RequestId) {
        lock(&self.routes).release(id);
        if lock(&self.receivers).remove(&id).is_some() {
            debug!("Released request {}", id);
        }
    }

    /// Stop the client. Calling it more than once is a no-op.
    ///
    /// Waits up to the shutdown grace period for the reader to exit. A reader
    /// still blocked on an open inbound stream after that is detached; the
    /// client is `Stopped` either way.
    pub fn shutdown(&self) {
        self.close_outbound();
        self.join_reader();
    }

    /// Enter `ShuttingDown` and close the outbound stream.
    ///
    /// Closing the engine's input is what lets a child process exit and the
    /// reader observe end-of-stream.
    pub(crate) fn close_outbound(&self) {
        {
            let mut routes = lock(&self.routes);
            match routes.state {
                ClientState::Created => routes.stop(),
                ClientState::Running => {
                    info!("Shutting down JSON-RPC client");
                    routes.state = ClientState::ShuttingDown;
                }
                ClientState::ShuttingDown | ClientState::Stopped => {}
            }
        }
        lock(&self.writer).take();
    }

    fn join_reader(&self) {
        let handle = lock(&self.reader_thread).take();
        if let Some(ReaderHandle { thread, exited }) = handle {
            match exited.recv_timeout(self.shutdown_grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if thread.join().is_err() {
                        error!("JSON-RPC reader thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => warn!(
                    "JSON-RPC reader did not stop within {:?}, detaching it",
                    self.shutdown_grace
                ),
            }
        }
        lock(&self.reader).take();
        lock(&self.routes).stop();
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        // Never block in drop on a reader that may still be waiting for input.
        self.close_outbound();
    }
}

/// Body of the background reader thread.
fn reader_loop(inbound: Inbound, shared: Arc<Mutex<Routes>>) {
    let mut frames = FrameDecoder::new(BufReader::new(inbound));

    let outcome = loop {
        match frames.next() {
            None => break Ok(()),
            Some(Err(e)) => break Err(e),
            Some(Ok(message)) => {
                let mut routes = lock(&shared);
                if routes.state != ClientState::Running {
                    break Ok(());
                }
                routes.dispatch(message);
            }
        }
    };

    let mut routes = lock(&shared);
    match outcome {
        Ok(()) => debug!("JSON-RPC reader exiting"),
        Err(e) => {
            error!("JSON-RPC reader stopped: {}", e);
            routes.failure = Some(e.to_string());
        }
    }
    routes.stop();
}
