//! Script runtime seam
//!
//! The filter never executes script text itself. It talks to a [`ScriptRuntime`], which loads
//! a script once per configuration, instantiates per-worker [`ScriptState`]s, and creates
//! [`Coroutine`]s bound to one of the script's entry points.
//!
//! A coroutine never holds a reference to the stream it runs for. When a script calls a host
//! function, the coroutine stops and hands back a [`HostCall`] message; the stream handle
//! answers it and resumes the coroutine with the reply, or leaves it suspended.

use crate::error::{Result, ScriptError};
use crate::value::Value;
use crate::wrappers::ObjectRef;
use std::fmt;
use std::sync::Arc;

/// Named entry points a script may define
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    /// Runs on the request (decode) path
    OnRequest,
    /// Runs on the response (encode) path
    OnResponse,
}

impl EntryPoint {
    /// Conventional function name of the entry point
    pub fn function_name(&self) -> &'static str {
        match self {
            Self::OnRequest => "on_request",
            Self::OnResponse => "on_response",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnRequest => write!(f, "request"),
            Self::OnResponse => write!(f, "response"),
        }
    }
}

/// Receiver of a host call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The stream handle itself
    Handle,
    /// A wrapper or iterator previously returned to the script
    Object(ObjectRef),
}

/// A host function invocation issued by a running coroutine
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    /// Receiver
    pub target: Target,
    /// Method name
    pub method: String,
    /// Positional arguments
    pub args: Vec<Value>,
}

impl HostCall {
    /// Call a stream handle method
    pub fn handle(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: Target::Handle,
            method: method.into(),
            args,
        }
    }

    /// Call a method on a host object
    pub fn object(object: ObjectRef, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: Target::Object(object),
            method: method.into(),
            args,
        }
    }
}

/// Answer to a host call, delivered when the coroutine resumes
pub type HostReply = std::result::Result<Vec<Value>, ScriptError>;

/// Coroutine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created but not started, or parked on a host call that yielded
    Suspended,
    /// Executing, or stopped on a host call that is being answered synchronously
    Running,
    /// Returned or raised
    Dead,
}

/// What a coroutine did when resumed
#[derive(Debug, Clone, PartialEq)]
pub enum CoroutineStep {
    /// The script called a host function and waits for its reply
    HostCall(HostCall),
    /// The entry point returned
    Finished,
}

/// One cooperative execution context bound to one entry point
pub trait Coroutine: fmt::Debug {
    /// Current status
    fn status(&self) -> CoroutineStatus;

    /// Run until the next host call or completion
    ///
    /// The first resume starts the entry point and takes no reply; every later resume
    /// delivers the reply to the host call returned by the previous step. An error means the
    /// script raised and the coroutine is dead.
    fn resume(&mut self, reply: Option<HostReply>) -> Result<CoroutineStep>;

    /// Park the coroutine on its outstanding host call until a later resume
    fn suspend(&mut self);
}

/// Script state owned by one worker
pub trait ScriptState: Send + Sync + fmt::Debug {
    /// Whether the script defines `entry`
    fn has_entry(&self, entry: EntryPoint) -> bool;

    /// Create a coroutine for `entry`, or `None` when the script does not define it
    fn create_coroutine(&self, entry: EntryPoint) -> Option<Box<dyn Coroutine>>;

    /// Memory held by the script state
    fn runtime_bytes_used(&self) -> usize {
        0
    }
}

/// A loaded script, shared read-only across workers
pub trait CompiledScript: Send + Sync + fmt::Debug {
    /// Name the script was loaded under
    fn name(&self) -> &str;

    /// Create the state one worker runs the script in
    fn instantiate(&self) -> Box<dyn ScriptState>;
}

/// Loads script source
pub trait ScriptRuntime: Send + Sync + fmt::Debug {
    /// Load `source`; `name` identifies the script in logs and errors
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn CompiledScript>>;
}
