//! # Octopus Scripting
//!
//! Runs user scripts against proxied HTTP streams.
//!
//! A script defines an entry point per direction (`on_request`, `on_response`). Each runs as a
//! coroutine that talks to the stream through host functions: reading and rewriting headers,
//! waiting for the body or trailers, calling upstream clusters, sending local replies.
//!
//! ## Features
//!
//! - Per-direction stream state machine with at most one outstanding upstream call
//! - Accessor objects valid for a single synchronous slice
//! - Default, named and per-route inline scripts, configured from YAML, TOML or JSON
//! - Pluggable script runtimes; a native runtime runs Rust async functions as scripts
//! - Per-worker script state
//! - Public key import and signature verification

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod callbacks;
pub mod config;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod handle;
pub mod native;
pub mod runtime;
pub mod slot;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod value;
pub mod wrappers;

pub use callbacks::{DecoderCallbacks, EncoderCallbacks, FilterCallbacks, CANONICAL_FILTER_NAME};
pub use config::{
    load_from_file, load_from_str, ConfigFormat, ErrorPolicy, FilterConfig, FilterConfigPerRoute,
    PerScriptSetup, ScriptFilterSettings, ScriptPerRouteSettings, ScriptSource,
};
pub use error::{Result, ScriptError};
pub use filter::ScriptFilter;
pub use handle::{State, StreamHandle};
pub use native::{NativeRuntime, NativeScript, StreamApi};
pub use runtime::{
    CompiledScript, Coroutine, CoroutineStatus, CoroutineStep, EntryPoint, HostCall, HostReply,
    ScriptRuntime, ScriptState, Target,
};
pub use slot::{SlotAllocator, ThreadLocalSlot};
pub use stats::FilterStats;
pub use value::{Args, Table, Value};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::config::{
        FilterConfig, FilterConfigPerRoute, ScriptFilterSettings, ScriptPerRouteSettings,
        ScriptSource,
    };
    pub use crate::error::{Result, ScriptError};
    pub use crate::filter::ScriptFilter;
    pub use crate::native::{NativeRuntime, NativeScript, StreamApi};
    pub use crate::runtime::{EntryPoint, ScriptRuntime};
    pub use crate::slot::SlotAllocator;
    pub use crate::value::Value;
}
