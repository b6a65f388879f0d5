//! Scripting operations against the SQL Tools Service.
//!
//! A [`ScriptingRequest`] sends one `scripting/script` call built from
//! [`ScriptingParams`] and hands back the engine's replies as typed
//! [`ScriptingMessage`]s until the terminal completion event.
//!
//! # Event sequence
//!
//! ```text
//! execute() ──► Response (direct result)
//!           ──► Plan      (objects to script)
//!           ──► Progress  (one per object)
//!           ──► Complete  (terminal, exactly once)
//! ```

mod events;
mod params;
mod request;

pub use events::{
    decode_response, ScriptCompleteEvent, ScriptPlanNotification, ScriptProgressNotification,
    ScriptResponse, ScriptingMessage, ScriptingObject, SCRIPT_COMPLETE_METHOD, SCRIPT_METHOD,
    SCRIPT_PLAN_METHOD, SCRIPT_PROGRESS_METHOD,
};
pub use params::{
    InvalidOptionError, ObjectCriterion, OptionKind, OptionSpec, OptionValue, ParameterError,
    ScriptingOptions, ScriptingParams, ScriptingParamsBuilder, DEFAULT_SCRIPT_DESTINATION,
    REDACTED, SCRIPTING_OPTIONS,
};
pub use request::{RequestState, ScriptingRequest};
