//! Entry point for driving a SQL Tools Service engine.
//!
//! `SqlToolsClient` owns the JSON-RPC transport (and optionally the engine
//! child process), hands out scripting requests with unique ids, and drains
//! them asynchronously on a tokio runtime.
//!
//! # Example
//!
//! ```ignore
//! let child = Command::new(engine)
//!     .stdin(Stdio::piped())
//!     .stdout(Stdio::piped())
//!     .spawn()?;
//! let mut client = SqlToolsClient::spawn(child, ClientConfig::from_env()?)?;
//!
//! let mut request = client.create_scripting_request(params)?;
//! request.execute()?;
//! let outcome = client.drain(&mut request, |message| println!("{:?}", message)).await?;
//!
//! client.shutdown();
//! ```

use std::io::{Read, Write};
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::jsonrpc::{ClientState, JsonRpcClient, RequestId, TransportError};
use crate::scripting::{
    RequestState, ScriptCompleteEvent, ScriptingMessage, ScriptingParams, ScriptingRequest,
};

/// Interval between exit checks while waiting for the engine to stop.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No terminal event arrived within the configured timeout.
    #[error("Scripting request {id} timed out after {limit:?}")]
    Timeout { id: RequestId, limit: Duration },

    /// The engine child was spawned without a piped stdin or stdout.
    #[error("Engine process has no piped {0}")]
    MissingPipe(&'static str),

    /// `drain` was called on a request that is not awaiting messages.
    #[error("Scripting request {id} is not draining (state: {state:?})")]
    NotDraining { id: RequestId, state: RequestState },
}

pub struct SqlToolsClient {
    rpc: Arc<JsonRpcClient>,
    next_id: AtomicU64,
    child: Option<Child>,
    config: ClientConfig,
}

impl SqlToolsClient {
    /// Connect over existing streams and start the response reader.
    ///
    /// [`shutdown`](Self::shutdown) waits up to `config.shutdown_grace` for
    /// `reader` to reach end-of-stream and detaches the reader after that.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the reader cannot be started.
    pub fn new<W, R>(writer: W, reader: R, config: ClientConfig) -> Result<Self, ClientError>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        let mut rpc = JsonRpcClient::new(writer, reader);
        rpc.set_shutdown_grace(config.shutdown_grace);
        rpc.start()?;

        Ok(Self {
            rpc: Arc::new(rpc),
            next_id: AtomicU64::new(1),
            child: None,
            config,
        })
    }

    /// Adopt an engine child process spawned with piped stdin and stdout.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::MissingPipe` if either pipe is absent; the child
    /// is killed in that case.
    pub fn spawn(mut child: Child, config: ClientConfig) -> Result<Self, ClientError> {
        let pipes = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            (None, _) => Err(ClientError::MissingPipe("stdin")),
            (_, None) => Err(ClientError::MissingPipe("stdout")),
        };
        let (stdin, stdout) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!("Attached to SQL Tools Service (pid {})", child.id());
        match Self::new(stdin, stdout, config) {
            Ok(mut client) => {
                client.child = Some(child);
                Ok(client)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.rpc.state()
    }

    /// Build a scripting request with the next request id. Ids start at 1.
    pub fn create_scripting_request(
        &self,
        params: ScriptingParams,
    ) -> Result<ScriptingRequest, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(ScriptingRequest::new(id, Arc::clone(&self.rpc), params)?)
    }

    /// Poll an executed request until its terminal event.
    ///
    /// Every message, the terminal one included, is passed to `on_message`
    /// in arrival order. Empty polls sleep for the configured poll interval.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotDraining` if the request was not executed or
    /// has already finished, and `ClientError::Timeout` if the configured
    /// request timeout elapses. A timed-out request is abandoned.
    pub async fn drain<F>(
        &self,
        request: &mut ScriptingRequest,
        mut on_message: F,
    ) -> Result<ScriptCompleteEvent, ClientError>
    where
        F: FnMut(&ScriptingMessage),
    {
        if request.state() != RequestState::Draining {
            return Err(ClientError::NotDraining {
                id: request.id(),
                state: request.state(),
            });
        }

        let poll_interval = self.config.poll_interval;
        let Some(limit) = self.config.request_timeout else {
            return Ok(poll_until_complete(request, poll_interval, &mut on_message).await);
        };

        let outcome = timeout(
            limit,
            poll_until_complete(request, poll_interval, &mut on_message),
        )
        .await;
        match outcome {
            Ok(event) => Ok(event),
            Err(_) => {
                request.abandon();
                Err(ClientError::Timeout {
                    id: request.id(),
                    limit,
                })
            }
        }
    }

    /// Stop the transport and the engine. Calling it more than once is a no-op.
    ///
    /// The engine's input is closed first; an owned child then gets the
    /// configured grace period to exit before it is killed.
    pub fn shutdown(&mut self) {
        self.rpc.close_outbound();
        if let Some(mut child) = self.child.take() {
            stop_child(&mut child, self.config.shutdown_grace);
        }
        self.rpc.shutdown();
    }
}

impl Drop for SqlToolsClient {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.shutdown();
        } else {
            self.rpc.close_outbound();
        }
    }
}

async fn poll_until_complete<F>(
    request: &mut ScriptingRequest,
    poll_interval: Duration,
    on_message: &mut F,
) -> ScriptCompleteEvent
where
    F: FnMut(&ScriptingMessage),
{
    loop {
        match request.get_response() {
            Some(message) => {
                on_message(&message);
                if let ScriptingMessage::Complete(event) = message {
                    return event;
                }
            }
            None => sleep(poll_interval).await,
        }
    }
}

/// Wait up to `grace` for the child to exit, then kill it.
fn stop_child(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("SQL Tools Service exited: {}", status);
                return;
            }
            Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => break,
            Err(e) => {
                warn!("Error waiting for SQL Tools Service: {}", e);
                break;
            }
        }
    }

    warn!("SQL Tools Service didn't exit gracefully, killing");
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::process::{Command, Stdio};

    fn params() -> ScriptingParams {
        ScriptingParams::builder("/tmp/out.sql", "Server=localhost;Password=secret")
            .build()
            .unwrap()
    }

    /// Client over two one-way socket pairs: (client, engine stdin, engine stdout).
    fn socket_client(config: ClientConfig) -> (SqlToolsClient, UnixStream, UnixStream) {
        let (requests_out, requests_in) = UnixStream::pair().unwrap();
        let (responses_in, responses_out) = UnixStream::pair().unwrap();
        let client = SqlToolsClient::new(requests_out, responses_in, config).unwrap();
        (client, requests_in, responses_out)
    }

    #[test]
    fn test_request_ids_start_at_one() {
        let (mut client, _stdin, stdout) = socket_client(ClientConfig::default());

        let first = client.create_scripting_request(params()).unwrap();
        let second = client.create_scripting_request(params()).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);

        drop(stdout);
        client.shutdown();
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_requires_executed_request() {
        let (mut client, _stdin, stdout) = socket_client(ClientConfig::default());
        let mut request = client.create_scripting_request(params()).unwrap();

        let err = client.drain(&mut request, |_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotDraining {
                id: 1,
                state: RequestState::Submitted
            }
        ));

        drop(stdout);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_drain_times_out_and_abandons() {
        let config = ClientConfig {
            poll_interval: Duration::from_millis(5),
            request_timeout: Some(Duration::from_millis(100)),
            ..ClientConfig::default()
        };
        let (mut client, _stdin, stdout) = socket_client(config);
        let mut request = client.create_scripting_request(params()).unwrap();
        request.execute().unwrap();

        let mut seen = 0;
        let err = client
            .drain(&mut request, |_| seen += 1)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { id: 1, .. }));
        assert_eq!(seen, 0);
        assert!(request.completed());

        drop(stdout);
        client.shutdown();
    }

    #[test]
    fn test_shutdown_returns_while_engine_keeps_streams_open() {
        let config = ClientConfig {
            shutdown_grace: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let (mut client, _stdin, _stdout) = socket_client(config);

        let started = Instant::now();
        client.shutdown();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[test]
    fn test_spawn_requires_pipes() {
        let child = Command::new("cat")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let err = SqlToolsClient::spawn(child, ClientConfig::default()).err();
        assert!(matches!(err, Some(ClientError::MissingPipe("stdin"))));
    }

    #[test]
    fn test_shutdown_stops_child() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let mut client = SqlToolsClient::spawn(child, ClientConfig::default()).unwrap();
        assert_eq!(client.state(), ClientState::Running);

        client.shutdown();
        assert_eq!(client.state(), ClientState::Stopped);
        client.shutdown();
        assert_eq!(client.state(), ClientState::Stopped);
    }
}
