//! One scripting operation over a shared [`JsonRpcClient`].

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::jsonrpc::{JsonRpcClient, RequestId, TransportError};
use crate::scripting::events::{decode_response, ScriptCompleteEvent, ScriptingMessage};
use crate::scripting::params::ScriptingParams;

/// Lifecycle of a [`ScriptingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created, not yet sent.
    Submitted,
    /// Sent; messages are being drained.
    Draining,
    /// The terminal event has been delivered. Terminal.
    Finished,
}

/// A `scripting/script` call and the stream of events it produces.
///
/// # Example
///
/// ```ignore
/// let mut request = ScriptingRequest::new(1, client, params)?;
/// request.execute()?;
/// while !request.completed() {
///     if let Some(message) = request.get_response() {
///         println!("{:?}", message);
///     }
/// }
/// ```
pub struct ScriptingRequest {
    id: RequestId,
    state: RequestState,
    client: Arc<JsonRpcClient>,
    params: ScriptingParams,
}

impl ScriptingRequest {
    pub const METHOD_NAME: &'static str = "scripting/script";

    /// Message of the completion event synthesized from a transport failure.
    pub const TRANSPORT_FAILURE_MESSAGE: &'static str =
        "Scripting request encountered an exception";

    /// # Errors
    ///
    /// Returns `TransportError::InvalidRequestId` for id 0.
    pub fn new(
        id: RequestId,
        client: Arc<JsonRpcClient>,
        params: ScriptingParams,
    ) -> Result<Self, TransportError> {
        if id == 0 {
            return Err(TransportError::InvalidRequestId);
        }

        Ok(Self {
            id,
            state: RequestState::Submitted,
            client,
            params,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn params(&self) -> &ScriptingParams {
        &self.params
    }

    /// True once the terminal event has been handed out.
    pub fn completed(&self) -> bool {
        self.state == RequestState::Finished
    }

    /// Send the request to the engine.
    ///
    /// # Errors
    ///
    /// Fails if the request was already executed or the submission is
    /// rejected by the transport. A rejected submission finishes the request.
    pub fn execute(&mut self) -> Result<(), TransportError> {
        if self.state != RequestState::Submitted {
            return Err(TransportError::AlreadyExecuted(self.id));
        }

        info!(
            "Executing scripting request {} to {}",
            self.id,
            self.params.file_path()
        );
        debug!("Scripting request {} parameters: {}", self.id, self.params.redacted());

        match self
            .client
            .submit_request(Self::METHOD_NAME, self.params.format(), self.id)
        {
            Ok(()) => {
                self.state = RequestState::Draining;
                Ok(())
            }
            Err(e) => {
                self.state = RequestState::Finished;
                Err(e)
            }
        }
    }

    /// Next decoded message, or `None` if nothing is queued.
    ///
    /// Always `None` unless the request is draining. A transport failure is
    /// reported once, as a failed [`ScriptCompleteEvent`].
    pub fn get_response(&mut self) -> Option<ScriptingMessage> {
        if self.state != RequestState::Draining {
            return None;
        }

        match self.client.get_response(self.id) {
            Ok(None) => None,
            Ok(Some(raw)) => {
                let message = decode_response(raw);
                if message.is_complete() {
                    debug!("Scripting request {} complete", self.id);
                    self.finish();
                }
                Some(message)
            }
            Err(e) => {
                warn!("Scripting request {} failed: {}", self.id, e);
                self.finish();
                Some(ScriptingMessage::Complete(ScriptCompleteEvent::failed(
                    self.id.to_string(),
                    Self::TRANSPORT_FAILURE_MESSAGE,
                    json!(e.to_string()),
                )))
            }
        }
    }

    /// Stop waiting for the terminal event and release the response queue.
    pub fn abandon(&mut self) {
        if self.state == RequestState::Draining {
            warn!("Abandoning scripting request {}", self.id);
            self.client.request_finished(self.id);
        }
        self.state = RequestState::Finished;
    }

    fn finish(&mut self) {
        self.state = RequestState::Finished;
        self.client.request_finished(self.id);
    }
}

impl std::fmt::Debug for ScriptingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptingRequest")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("params", &self.params)
            .finish()
    }
}
