//! mssqlscripter client library
//!
//! Drives the SQL Tools Service scripting engine over JSON-RPC:
//!
//! - `jsonrpc` - Content-Length framing and the request/response transport
//! - `scripting` - Scripting parameters, typed events and the request state machine
//! - `sqltools` - Client facade that owns the engine and drains requests
//! - `config` - Timing configuration from the environment
//!
//! # Usage
//!
//! ```ignore
//! use mssqlscripter_client::config::ClientConfig;
//! use mssqlscripter_client::scripting::ScriptingParams;
//! use mssqlscripter_client::sqltools::SqlToolsClient;
//!
//! let mut client = SqlToolsClient::spawn(child, ClientConfig::from_env()?)?;
//! let params = ScriptingParams::builder("out.sql", connection_string)
//!     .include_objects(["dbo.Customers"])
//!     .build()?;
//!
//! let mut request = client.create_scripting_request(params)?;
//! request.execute()?;
//! let outcome = client.drain(&mut request, |_| {}).await?;
//! client.shutdown();
//! ```

pub mod config;
pub mod jsonrpc;
pub mod scripting;
pub mod sqltools;
