//! Native script runtime
//!
//! Scripts are Rust async functions registered under a name. The configured script source is
//! the registered name; loading an unknown name fails like a syntax error would.
//!
//! ```ignore
//! let runtime = NativeRuntime::new().register(
//!     "add_header",
//!     NativeScript::new().on_request(|api: StreamApi| async move {
//!         let headers = api.headers().await?;
//!         headers.call("add", vec!["x-script".into(), "1".into()]).await?;
//!         Ok(())
//!     }),
//! );
//! ```

mod api;
mod coroutine;

pub use api::{BodyChunks, HostObject, StreamApi};
pub use coroutine::HostCallFuture;

use crate::error::{Result, ScriptError};
use crate::runtime::{CompiledScript, Coroutine, EntryPoint, ScriptRuntime, ScriptState};
use coroutine::{NativeCoroutine, SharedMailbox};
use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type EntryFn = Arc<dyn Fn(StreamApi) -> LocalBoxFuture<'static, Result<()>> + Send + Sync>;

/// Entry points of one native script
#[derive(Clone, Default)]
pub struct NativeScript {
    on_request: Option<EntryFn>,
    on_response: Option<EntryFn>,
}

impl NativeScript {
    /// Script with no entry points
    pub fn new() -> Self {
        Self::default()
    }

    fn wrap<F, Fut>(f: F) -> EntryFn
    where
        F: Fn(StreamApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Arc::new(move |api: StreamApi| Box::pin(f(api)) as LocalBoxFuture<'static, Result<()>>)
    }

    /// Set the request entry point
    pub fn on_request<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StreamApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.on_request = Some(Self::wrap(f));
        self
    }

    /// Set the response entry point
    pub fn on_response<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StreamApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.on_response = Some(Self::wrap(f));
        self
    }

    fn entry(&self, entry: EntryPoint) -> Option<&EntryFn> {
        match entry {
            EntryPoint::OnRequest => self.on_request.as_ref(),
            EntryPoint::OnResponse => self.on_response.as_ref(),
        }
    }
}

impl fmt::Debug for NativeScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeScript")
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

/// [`ScriptRuntime`] over registered native scripts
#[derive(Debug, Clone, Default)]
pub struct NativeRuntime {
    scripts: HashMap<String, NativeScript>,
}

impl NativeRuntime {
    /// Runtime with no scripts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script under `name`
    pub fn register(mut self, name: impl Into<String>, script: NativeScript) -> Self {
        self.insert(name, script);
        self
    }

    /// Register a script under `name`, replacing any previous one
    pub fn insert(&mut self, name: impl Into<String>, script: NativeScript) {
        self.scripts.insert(name.into(), script);
    }
}

impl ScriptRuntime for NativeRuntime {
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn CompiledScript>> {
        let key = source.trim();
        let script = self.scripts.get(key).ok_or_else(|| {
            ScriptError::compilation(format!(
                "{}: no native script registered as '{}'",
                name, key
            ))
        })?;
        debug!(script = %name, source = %key, "loaded native script");
        Ok(Arc::new(NativeCompiledScript {
            name: name.to_string(),
            script: script.clone(),
        }))
    }
}

#[derive(Debug)]
struct NativeCompiledScript {
    name: String,
    script: NativeScript,
}

impl CompiledScript for NativeCompiledScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self) -> Box<dyn ScriptState> {
        Box::new(NativeState {
            name: self.name.clone(),
            script: self.script.clone(),
        })
    }
}

#[derive(Debug)]
struct NativeState {
    name: String,
    script: NativeScript,
}

impl ScriptState for NativeState {
    fn has_entry(&self, entry: EntryPoint) -> bool {
        self.script.entry(entry).is_some()
    }

    fn create_coroutine(&self, entry: EntryPoint) -> Option<Box<dyn Coroutine>> {
        let f = self.script.entry(entry)?;
        let mailbox = SharedMailbox::default();
        let future = (**f)(StreamApi::new(mailbox.clone()));
        Some(Box::new(NativeCoroutine::new(
            format!("{}:{}", self.name, entry.function_name()),
            future,
            mailbox,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CoroutineStatus, CoroutineStep, HostCall};
    use crate::value::Value;

    fn runtime() -> NativeRuntime {
        NativeRuntime::new().register(
            "headers_only",
            NativeScript::new().on_request(|api: StreamApi| async move {
                api.call("headers", vec![]).await?;
                Ok(())
            }),
        )
    }

    #[test]
    fn test_compile_unknown_script_fails() {
        let err = runtime().compile("default", "missing").unwrap_err();
        assert!(matches!(err, ScriptError::CompilationError { .. }));
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn test_entry_points() {
        let compiled = runtime().compile("default", "  headers_only\n").unwrap();
        assert_eq!(compiled.name(), "default");

        let state = compiled.instantiate();
        assert!(state.has_entry(EntryPoint::OnRequest));
        assert!(!state.has_entry(EntryPoint::OnResponse));
        assert!(state.create_coroutine(EntryPoint::OnResponse).is_none());

        let mut co = state.create_coroutine(EntryPoint::OnRequest).unwrap();
        assert_eq!(co.status(), CoroutineStatus::Suspended);
        assert_eq!(
            co.resume(None).unwrap(),
            CoroutineStep::HostCall(HostCall::handle("headers", vec![]))
        );
        assert_eq!(
            co.resume(Some(Ok(vec![Value::Nil]))).unwrap(),
            CoroutineStep::Finished
        );
    }
}
