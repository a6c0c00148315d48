//! Host-function surface as seen by native scripts

use super::coroutine::{HostCallFuture, SharedMailbox};
use crate::error::{Result, ScriptError};
use crate::runtime::HostCall;
use crate::value::Value;
use crate::wrappers::ObjectRef;

fn first(values: Vec<Value>) -> Value {
    values.into_iter().next().unwrap_or_default()
}

/// Handle a native script uses to call into its stream
///
/// Every method suspends the script until the stream handle answers; calls that block on
/// the proxy (full body, next chunk, trailers, upstream call) resume on a later proxy event.
#[derive(Debug, Clone)]
pub struct StreamApi {
    mailbox: SharedMailbox,
}

impl StreamApi {
    pub(crate) fn new(mailbox: SharedMailbox) -> Self {
        Self { mailbox }
    }

    /// Call a stream handle function by name
    pub fn call(&self, method: &str, args: Vec<Value>) -> HostCallFuture {
        HostCallFuture::new(HostCall::handle(method, args), self.mailbox.clone())
    }

    /// Call a method on a host object
    pub fn call_object(&self, object: ObjectRef, method: &str, args: Vec<Value>) -> HostCallFuture {
        HostCallFuture::new(HostCall::object(object, method, args), self.mailbox.clone())
    }

    /// Interpret a returned value as a host object
    pub fn object(&self, value: &Value) -> Result<Option<HostObject>> {
        match value {
            Value::Nil => Ok(None),
            Value::Object(object) => Ok(Some(HostObject {
                api: self.clone(),
                object: *object,
            })),
            other => Err(ScriptError::type_error(format!(
                "expected host object, got {}",
                other.type_name()
            ))),
        }
    }

    async fn call_for_object(&self, method: &str, args: Vec<Value>) -> Result<Option<HostObject>> {
        let value = first(self.call(method, args).await?);
        self.object(&value)
    }

    async fn call_for_required_object(&self, method: &str) -> Result<HostObject> {
        self.call_for_object(method, vec![])
            .await?
            .ok_or_else(|| ScriptError::runtime(format!("{}() returned nil", method)))
    }

    /// Request or response headers
    pub async fn headers(&self) -> Result<HostObject> {
        self.call_for_required_object("headers").await
    }

    /// Full body; suspends until the stream ends
    pub async fn body(&self) -> Result<Option<HostObject>> {
        self.call_for_object("body", vec![]).await
    }

    /// Full body, wrapping an empty buffer when the stream had none
    pub async fn body_always_wrap(&self) -> Result<HostObject> {
        self.call_for_object("body", vec![Value::Bool(true)])
            .await?
            .ok_or_else(|| ScriptError::runtime("body() returned nil"))
    }

    /// Chunk iterator over the body
    pub async fn body_chunks(&self) -> Result<BodyChunks> {
        let iterator = self.call_for_required_object("bodyChunks").await?;
        Ok(BodyChunks { iterator })
    }

    /// Trailers, or `None` when the stream ended without them
    pub async fn trailers(&self) -> Result<Option<HostObject>> {
        self.call_for_object("trailers", vec![]).await
    }

    /// Route metadata for this filter
    pub async fn metadata(&self) -> Result<HostObject> {
        self.call_for_required_object("metadata").await
    }

    /// Stream info
    pub async fn stream_info(&self) -> Result<HostObject> {
        self.call_for_required_object("streamInfo").await
    }

    /// Downstream connection
    pub async fn connection(&self) -> Result<Option<HostObject>> {
        self.call_for_object("connection", vec![]).await
    }

    /// Connection-level stream info
    pub async fn connection_stream_info(&self) -> Result<Option<HostObject>> {
        self.call_for_object("connectionStreamInfo", vec![]).await
    }

    /// Matched virtual host
    pub async fn virtual_host(&self) -> Result<HostObject> {
        self.call_for_required_object("virtualHost").await
    }

    /// Per-route filter context
    pub async fn filter_context(&self) -> Result<Value> {
        Ok(first(self.call("filterContext", vec![]).await?))
    }

    /// Blocking upstream call; returns `(headers, body)` or `(nil, reason)`
    pub async fn http_call(
        &self,
        cluster: &str,
        headers: Value,
        body: Option<&str>,
        timeout_ms: i64,
    ) -> Result<(Value, Value)> {
        let values = self
            .call(
                "httpCall",
                vec![cluster.into(), headers, body.into(), timeout_ms.into()],
            )
            .await?;
        let mut values = values.into_iter();
        let headers = values.next().unwrap_or_default();
        let body = values.next().unwrap_or_default();
        Ok((headers, body))
    }

    /// Fire-and-forget upstream call
    pub async fn http_call_async(
        &self,
        cluster: &str,
        headers: Value,
        body: Option<&str>,
        timeout_ms: i64,
    ) -> Result<()> {
        self.call(
            "httpCall",
            vec![
                cluster.into(),
                headers,
                body.into(),
                timeout_ms.into(),
                Value::Bool(true),
            ],
        )
        .await?;
        Ok(())
    }

    /// Send a local reply; the script does not run past this call
    pub async fn respond(&self, headers: Value, body: Option<&str>) -> Result<()> {
        self.call("respond", vec![headers, body.into()]).await?;
        Ok(())
    }

    /// Log through the proxy at info level
    pub async fn log_info(&self, message: &str) -> Result<()> {
        self.call("logInfo", vec![message.into()]).await?;
        Ok(())
    }
}

/// A wrapper or other host object handed to a native script
#[derive(Debug, Clone)]
pub struct HostObject {
    api: StreamApi,
    object: ObjectRef,
}

impl HostObject {
    /// Underlying reference
    pub fn object_ref(&self) -> ObjectRef {
        self.object
    }

    /// Call a method, returning every result
    pub fn call(&self, method: &str, args: Vec<Value>) -> HostCallFuture {
        self.api.call_object(self.object, method, args)
    }

    /// Call a method, returning its first result
    pub async fn call_first(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        Ok(first(self.call(method, args).await?))
    }

    /// Call a method that returns another host object
    pub async fn call_object(&self, method: &str, args: Vec<Value>) -> Result<Option<HostObject>> {
        let value = self.call_first(method, args).await?;
        self.api.object(&value)
    }

    /// `get(key)` as a UTF-8 string
    pub async fn get_str(&self, key: &str) -> Result<Option<String>> {
        let value = self.call_first("get", vec![key.into()]).await?;
        Ok(value.as_str().map(str::to_string))
    }
}

/// Iterator returned by `bodyChunks()`
#[derive(Debug, Clone)]
pub struct BodyChunks {
    iterator: HostObject,
}

impl BodyChunks {
    /// Next chunk and whether it ends the stream; `None` once the stream ended
    pub async fn next(&self) -> Result<Option<(HostObject, bool)>> {
        let values = self.iterator.call("next", vec![]).await?;
        let mut values = values.into_iter();
        let chunk = values.next().unwrap_or_default();
        let end_stream = values.next().and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(self
            .iterator
            .api
            .object(&chunk)?
            .map(|chunk| (chunk, end_stream)))
    }
}
