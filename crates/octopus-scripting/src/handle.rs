//! Per-direction bridge between a coroutine and the proxy
//!
//! A [`StreamHandle`] answers the host calls a coroutine makes and owns the state machine
//! that decides when the coroutine runs. It never owns the coroutine: the filter passes the
//! coroutine in on every operation, so neither side references the other.
//!
//! ```text
//!              body()            bodyChunks():next()     trailers()         httpCall()
//!   Running ──────────▶ WaitForBody   WaitForBodyChunk   WaitForTrailers   HttpCall
//!      ▲                     │               │                 │              │
//!      └─────────────────────┴───────────────┴─────────────────┴──────────────┘
//!                      data / trailers / call completion resume the script
//!
//!   Running ── respond() ──▶ Responded (terminal)
//! ```

use crate::callbacks::{filter_metadata, FilterCallbacks};
use crate::crypto::{self, PublicKey};
use crate::error::{Result, ScriptError};
use crate::runtime::{Coroutine, CoroutineStep, EntryPoint, HostCall, HostReply, Target};
use crate::value::{Args, Table, Value};
use crate::wrappers::{
    self, BufferSource, BufferWrapper, CacheKey, ConnectionStreamInfoWrapper, ConnectionWrapper,
    HeaderKind, HeaderMapWrapper, MetadataMapWrapper, ObjectKind, ObjectRef, PublicKeyWrapper,
    Reply, StreamInfoWrapper, VirtualHostWrapper, Wrapper, WrapperArena, WrapperContext,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use octopus_core::{
    AsyncRequest, CallDispatch, CallId, ClusterManager, FailureReason,
    FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, HeaderMap, HttpCallRequest,
    HttpCallResponse, RequestOptions, SharedHeaderMap, TimeSource,
};
use std::collections::btree_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const CHILD_SPAN_NAME: &str = "script_route";

/// Where the handle is in its conversation with the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The script is running, or finished
    Running,
    /// Suspended until the next body chunk
    WaitForBodyChunk,
    /// Suspended until the full body is buffered
    WaitForBody,
    /// Suspended until trailers arrive or the stream ends
    WaitForTrailers,
    /// Suspended on an outbound call
    HttpCall,
    /// The script sent a local reply; it never runs again
    Responded,
}

/// Answer of a handle method
#[derive(Debug)]
pub(crate) enum HandleReply {
    /// Resume the script right away with these values
    Values(Vec<Value>),
    /// Park the script until a later stream event
    Yield,
}

impl HandleReply {
    fn value(value: impl Into<Value>) -> Self {
        Self::Values(vec![value.into()])
    }

    fn object(object: ObjectRef) -> Self {
        Self::value(Value::Object(object))
    }

    fn none() -> Self {
        Self::Values(Vec::new())
    }
}

pub(crate) type HandleMethod =
    fn(&mut StreamHandle, &mut dyn FilterCallbacks, &Args) -> Result<HandleReply>;

/// Per-direction stream state shared with the script through host calls
pub struct StreamHandle {
    entry: EntryPoint,
    state: State,
    headers: SharedHeaderMap,
    end_stream: bool,
    buffered_body: bool,
    saw_body: bool,
    headers_continued: bool,
    trailers: Option<SharedHeaderMap>,
    http_request: Option<Box<dyn AsyncRequest>>,
    return_duplicate_headers: bool,
    always_wrap_body: bool,
    wrappers: WrapperArena,
    current_chunk: Option<BytesMut>,
    reset: bool,
    public_keys: HashMap<Bytes, PublicKey>,
    cluster_manager: Arc<dyn ClusterManager>,
    time_source: Arc<dyn TimeSource>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("entry", &self.entry)
            .field("state", &self.state)
            .field("end_stream", &self.end_stream)
            .field("headers_continued", &self.headers_continued)
            .field("http_request", &self.http_request)
            .field("reset", &self.reset)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub(crate) const METHODS: &'static [(&'static str, HandleMethod)] = &[
        ("headers", Self::headers),
        ("body", Self::body),
        ("bodyChunks", Self::body_chunks),
        ("trailers", Self::trailers),
        ("metadata", Self::metadata),
        ("httpCall", Self::http_call),
        ("respond", Self::respond),
        ("streamInfo", Self::stream_info),
        ("connection", Self::connection),
        ("connectionStreamInfo", Self::connection_stream_info),
        ("importPublicKey", Self::import_public_key),
        ("verifySignature", Self::verify_signature),
        ("base64Escape", Self::base64_escape),
        ("timestamp", Self::timestamp),
        ("timestampString", Self::timestamp_string),
        ("setUpstreamOverrideHost", Self::set_upstream_override_host),
        ("clearRouteCache", Self::clear_route_cache),
        ("filterContext", Self::filter_context),
        ("virtualHost", Self::virtual_host),
        ("logTrace", Self::log_trace),
        ("logDebug", Self::log_debug),
        ("logInfo", Self::log_info),
        ("logWarn", Self::log_warn),
        ("logErr", Self::log_err),
        ("logCritical", Self::log_critical),
    ];

    /// Create a handle for the headers of one direction
    pub fn new(
        entry: EntryPoint,
        headers: SharedHeaderMap,
        end_stream: bool,
        cluster_manager: Arc<dyn ClusterManager>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            entry,
            state: State::Running,
            headers,
            end_stream,
            buffered_body: false,
            saw_body: false,
            headers_continued: false,
            trailers: None,
            http_request: None,
            return_duplicate_headers: false,
            always_wrap_body: false,
            wrappers: WrapperArena::default(),
            current_chunk: None,
            reset: false,
            public_keys: HashMap::new(),
            cluster_manager,
            time_source,
        }
    }

    /// Names of every host function scripts can call on the handle
    pub fn method_names() -> impl Iterator<Item = &'static str> {
        Self::METHODS.iter().map(|(name, _)| *name)
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the headers of this direction were passed on
    pub fn headers_continued(&self) -> bool {
        self.headers_continued
    }

    /// Identifier of the outstanding call, if the script is waiting on one
    pub fn pending_call_id(&self) -> Option<CallId> {
        self.http_request.as_ref().map(|request| request.id())
    }

    /// Number of wrappers currently alive
    pub fn live_wrappers(&self) -> usize {
        self.wrappers.live_wrappers()
    }

    /// Tear down every wrapper handed out so far
    pub fn invalidate_wrappers(&mut self) {
        self.wrappers.invalidate();
    }

    /// Run the script for the headers event
    pub fn start(
        &mut self,
        coroutine: &mut dyn Coroutine,
        callbacks: &mut dyn FilterCallbacks,
    ) -> Result<FilterHeadersStatus> {
        self.resume(coroutine, callbacks, None)?;
        Ok(match self.state {
            State::WaitForBody | State::HttpCall => FilterHeadersStatus::StopIteration,
            State::Responded => FilterHeadersStatus::LocalReplySent,
            _ => {
                self.headers_continued = true;
                FilterHeadersStatus::Continue
            }
        })
    }

    /// Deliver a body chunk
    ///
    /// A script waiting on `bodyChunks()` sees the chunk in place and may rewrite it.
    pub fn on_data(
        &mut self,
        coroutine: &mut dyn Coroutine,
        callbacks: &mut dyn FilterCallbacks,
        data: &mut BytesMut,
        end_stream: bool,
    ) -> Result<FilterDataStatus> {
        self.end_stream = end_stream;
        self.saw_body = true;

        match self.state {
            State::WaitForBodyChunk => {
                trace!(len = data.len(), end_stream, "resuming script with body chunk");
                self.current_chunk = Some(std::mem::take(data));
                let chunk = self.wrappers.insert(Wrapper::Buffer(BufferWrapper::new(
                    BufferSource::Chunk,
                    self.headers.clone(),
                )));
                let result = self.resume(
                    coroutine,
                    callbacks,
                    Some(Ok(vec![Value::Object(chunk), Value::Bool(end_stream)])),
                );
                *data = self.current_chunk.take().unwrap_or_default();
                result?;
            }
            State::WaitForBody if end_stream => {
                debug!("resuming script with full body");
                callbacks.add_data(&data.split());
                let body = self.body_value(callbacks, self.always_wrap_body);
                self.resume(coroutine, callbacks, Some(Ok(vec![body])))?;
            }
            State::WaitForTrailers if end_stream => {
                debug!("stream ended without trailers");
                self.resume(coroutine, callbacks, Some(Ok(Vec::new())))?;
            }
            _ => {}
        }

        Ok(match self.state {
            State::HttpCall | State::WaitForBody => {
                trace!("buffering body");
                FilterDataStatus::StopIterationAndBuffer
            }
            State::WaitForBodyChunk => {
                trace!("script waiting for next body chunk");
                FilterDataStatus::StopIterationNoBuffer
            }
            _ => {
                self.headers_continued = true;
                FilterDataStatus::Continue
            }
        })
    }

    /// Deliver trailers; they always end the stream
    pub fn on_trailers(
        &mut self,
        coroutine: &mut dyn Coroutine,
        callbacks: &mut dyn FilterCallbacks,
        trailers: SharedHeaderMap,
    ) -> Result<FilterTrailersStatus> {
        self.end_stream = true;
        self.trailers = Some(trailers);

        match self.state {
            State::WaitForBodyChunk => {
                debug!("resuming body chunk iteration at trailers");
                self.resume(coroutine, callbacks, Some(Ok(Vec::new())))?;
            }
            State::WaitForBody => {
                debug!("resuming script with full body at trailers");
                let body = self.body_value(callbacks, self.always_wrap_body);
                self.resume(coroutine, callbacks, Some(Ok(vec![body])))?;
            }
            _ => {}
        }

        if self.state == State::WaitForTrailers {
            debug!("resuming script with trailers");
            let trailers = self.trailers_object().map(Value::Object);
            self.resume(coroutine, callbacks, Some(Ok(vec![Value::from(trailers)])))?;
        }

        Ok(match self.state {
            State::HttpCall => FilterTrailersStatus::StopIteration,
            _ => FilterTrailersStatus::Continue,
        })
    }

    /// Deliver the outcome of the outstanding call
    ///
    /// When the script is left running, iteration is continued even if it raised.
    pub fn on_http_call_complete(
        &mut self,
        coroutine: &mut dyn Coroutine,
        callbacks: &mut dyn FilterCallbacks,
        outcome: std::result::Result<HttpCallResponse, FailureReason>,
    ) -> Result<()> {
        self.http_request = None;
        if self.reset || self.state != State::HttpCall {
            debug!(state = ?self.state, reset = self.reset, "dropping call completion");
            return Ok(());
        }

        debug!(success = outcome.is_ok(), "resuming script after call");
        let values = self.call_outcome(outcome);
        let result = self.resume(coroutine, callbacks, Some(Ok(values)));
        if self.state == State::Running {
            self.headers_continued = true;
            callbacks.continue_iteration();
        }
        result
    }

    /// The stream went away
    ///
    /// The outstanding call is cancelled, and the script is never resumed again.
    pub fn on_reset(&mut self) {
        if let Some(mut request) = self.http_request.take() {
            debug!(id = request.id(), "cancelling call on reset");
            request.cancel();
        }
        self.reset = true;
        self.wrappers.invalidate();
    }

    /// Run the coroutine until it yields, finishes, or raises
    fn resume(
        &mut self,
        coroutine: &mut dyn Coroutine,
        callbacks: &mut dyn FilterCallbacks,
        reply: Option<HostReply>,
    ) -> Result<()> {
        if self.reset {
            debug!(entry = %self.entry, "stream was reset, not resuming script");
            self.wrappers.invalidate();
            return Ok(());
        }

        self.state = State::Running;
        let mut reply = reply;
        let result = loop {
            let call = match coroutine.resume(reply.take()) {
                Ok(CoroutineStep::HostCall(call)) => call,
                Ok(CoroutineStep::Finished) => {
                    trace!(entry = %self.entry, "script finished");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };
            match self.dispatch(call, callbacks) {
                Ok(HandleReply::Values(values)) => reply = Some(Ok(values)),
                Ok(HandleReply::Yield) => {
                    debug!(entry = %self.entry, state = ?self.state, "script yielded");
                    coroutine.suspend();
                    break Ok(());
                }
                Err(err) => reply = Some(Err(err)),
            }
        };

        self.wrappers.invalidate();
        result
    }

    fn dispatch(&mut self, call: HostCall, callbacks: &mut dyn FilterCallbacks) -> Result<HandleReply> {
        let HostCall {
            target,
            method,
            args,
        } = call;
        let args = Args::new(args);

        match target {
            Target::Handle => {
                let f = wrappers::lookup(Self::METHODS, &method).ok_or_else(|| {
                    ScriptError::runtime(format!("attempt to call unknown function '{}'", method))
                })?;
                f(self, callbacks, &args)
            }
            Target::Object(object) if object.kind() == ObjectKind::BodyChunks => {
                if method != "next" {
                    return Err(ScriptError::runtime(format!(
                        "attempt to call unknown method '{}' on body chunk iterator",
                        method
                    )));
                }
                self.next_body_chunk()
            }
            Target::Object(object) => {
                let mut ctx = WrapperContext {
                    callbacks,
                    headers_continued: self.headers_continued,
                    current_chunk: &mut self.current_chunk,
                };
                let reply = self.wrappers.get_mut(object)?.call(&method, &mut ctx, &args)?;
                Ok(match reply {
                    Reply::Values(values) => HandleReply::Values(values),
                    Reply::Object(wrapper) => HandleReply::object(self.wrappers.insert(wrapper)),
                })
            }
        }
    }

    fn body_value(&mut self, callbacks: &dyn FilterCallbacks, always_wrap: bool) -> Value {
        if callbacks.buffered_body().is_none() && !always_wrap {
            debug!("end stream, no body");
            return Value::Nil;
        }
        let headers = self.headers.clone();
        Value::Object(self.wrappers.cached(CacheKey::Body, || {
            Wrapper::Buffer(BufferWrapper::new(BufferSource::Body, headers))
        }))
    }

    fn trailers_object(&mut self) -> Option<ObjectRef> {
        let trailers = self.trailers.clone()?;
        Some(self.wrappers.cached(CacheKey::Trailers, || {
            Wrapper::HeaderMap(HeaderMapWrapper::new(trailers, HeaderKind::Trailers))
        }))
    }

    fn next_body_chunk(&mut self) -> Result<HandleReply> {
        if self.end_stream {
            return Ok(HandleReply::none());
        }
        debug!("yielding for next body chunk");
        self.state = State::WaitForBodyChunk;
        Ok(HandleReply::Yield)
    }

    fn call_outcome(
        &self,
        outcome: std::result::Result<HttpCallResponse, FailureReason>,
    ) -> Vec<Value> {
        let response = match outcome {
            Ok(response) => response,
            Err(reason) => return vec![Value::Nil, reason.to_string().into()],
        };

        let mut table = Table::new();
        for (key, value) in response.headers.iter() {
            let value = Value::from(value);
            match table.entry(key.to_string()) {
                Entry::Occupied(mut entry) if self.return_duplicate_headers => {
                    let existing = entry.get_mut();
                    if let Value::Array(values) = existing {
                        values.push(value);
                    } else {
                        let first = std::mem::take(existing);
                        *existing = Value::Array(vec![first, value]);
                    }
                }
                Entry::Occupied(mut entry) => {
                    entry.insert(value);
                }
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            }
        }

        let body = if response.body.is_empty() {
            Value::Nil
        } else {
            Value::String(response.body)
        };
        vec![Value::Table(table), body]
    }

    fn headers(&mut self, _callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        let headers = self.headers.clone();
        Ok(HandleReply::object(self.wrappers.cached(CacheKey::Headers, || {
            Wrapper::HeaderMap(HeaderMapWrapper::new(headers, HeaderKind::Headers))
        })))
    }

    fn body(&mut self, callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let always_wrap = args.opt_bool(0)?.unwrap_or(false);
        if self.end_stream {
            if !self.buffered_body && self.saw_body {
                return Err(ScriptError::runtime(
                    "cannot call body() after body has been streamed",
                ));
            }
            return Ok(HandleReply::value(self.body_value(callbacks, always_wrap)));
        }
        if self.saw_body {
            return Err(ScriptError::runtime(
                "cannot call body() after body streaming has started",
            ));
        }

        debug!("yielding for full body");
        self.state = State::WaitForBody;
        self.buffered_body = true;
        self.always_wrap_body = always_wrap;
        Ok(HandleReply::Yield)
    }

    fn body_chunks(&mut self, _callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        if self.saw_body {
            return Err(ScriptError::runtime(
                "cannot call bodyChunks after body processing has begun",
            ));
        }
        Ok(HandleReply::object(ObjectRef::body_chunks()))
    }

    fn trailers(&mut self, _callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        if let Some(trailers) = self.trailers_object() {
            return Ok(HandleReply::object(trailers));
        }
        if self.end_stream {
            debug!("end stream, no trailers");
            return Ok(HandleReply::none());
        }
        debug!("yielding for trailers");
        self.state = State::WaitForTrailers;
        Ok(HandleReply::Yield)
    }

    fn metadata(&mut self, callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        Ok(HandleReply::object(self.wrappers.cached(CacheKey::Metadata, || {
            Wrapper::Metadata(MetadataMapWrapper::new(callbacks.metadata()))
        })))
    }

    fn stream_info(&mut self, _callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        Ok(HandleReply::object(self.wrappers.cached(CacheKey::StreamInfo, || {
            Wrapper::StreamInfo(StreamInfoWrapper)
        })))
    }

    fn connection(&mut self, callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        if callbacks.connection().is_none() {
            return Ok(HandleReply::value(Value::Nil));
        }
        Ok(HandleReply::object(self.wrappers.cached(CacheKey::Connection, || {
            Wrapper::Connection(ConnectionWrapper)
        })))
    }

    fn connection_stream_info(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        _args: &Args,
    ) -> Result<HandleReply> {
        if callbacks.connection().is_none() {
            return Ok(HandleReply::value(Value::Nil));
        }
        Ok(HandleReply::object(self.wrappers.cached(
            CacheKey::ConnectionStreamInfo,
            || Wrapper::ConnectionStreamInfo(ConnectionStreamInfoWrapper),
        )))
    }

    fn virtual_host(&mut self, callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        Ok(HandleReply::object(self.wrappers.cached(CacheKey::VirtualHost, || {
            let metadata = callbacks
                .stream_info()
                .virtual_host()
                .map(|vhost| filter_metadata(&vhost.metadata, callbacks.filter_config_name()))
                .unwrap_or_default();
            Wrapper::VirtualHost(VirtualHostWrapper::new(metadata))
        })))
    }

    fn filter_context(&mut self, callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        Ok(HandleReply::value(callbacks.filter_context()))
    }

    fn http_call(&mut self, callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let (asynchronous, return_duplicate_headers) = match args.get(4) {
            Value::Nil => (false, false),
            Value::Bool(asynchronous) => (*asynchronous, false),
            Value::Table(options) => {
                let flag = |name: &str| match options.get(name) {
                    None | Some(Value::Nil) => Ok(false),
                    Some(Value::Bool(b)) => Ok(*b),
                    Some(_) => Err(ScriptError::runtime(format!(
                        "http call option '{}' must be a boolean",
                        name
                    ))),
                };
                (flag("asynchronous")?, flag("return_duplicate_headers")?)
            }
            _ => {
                return Err(ScriptError::runtime(
                    "http call asynchronous flag must be 'true', 'false', or empty",
                ))
            }
        };

        let cluster = args.check_str(0)?;
        if cluster.is_empty() || !self.cluster_manager.has_cluster(cluster) {
            return Err(ScriptError::runtime(
                "http call cluster invalid. Must be configured",
            ));
        }

        let mut headers = build_headers(
            args.check_table(1)?,
            "http call header values must be strings or arrays of strings",
        )?;
        if headers.path().is_none() || headers.method().is_none() || headers.host().is_none() {
            return Err(ScriptError::runtime(
                "http call headers must include ':path', ':method', and ':authority'",
            ));
        }

        let body = args.opt_bytes(2)?.cloned();
        if let Some(body) = &body {
            headers.set_content_length(body.len());
        }

        let timeout_ms = args.check_integer(3)?;
        let timeout = match u64::try_from(timeout_ms) {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => return Err(ScriptError::runtime("http call timeout must be >= 0")),
        };

        let options = RequestOptions {
            timeout,
            parent_span: callbacks.active_span(),
            child_span_name: CHILD_SPAN_NAME.to_string(),
        };
        let dispatch = self
            .cluster_manager
            .send(cluster, HttpCallRequest { headers, body }, options)
            .map_err(|e| ScriptError::runtime(e.to_string()))?;

        if asynchronous {
            debug!(cluster, "issued asynchronous call");
            return Ok(HandleReply::none());
        }

        self.return_duplicate_headers = return_duplicate_headers;
        match dispatch {
            CallDispatch::Completed(outcome) => Ok(HandleReply::Values(self.call_outcome(outcome))),
            CallDispatch::Pending(request) => {
                debug!(cluster, id = request.id(), "yielding for call");
                self.http_request = Some(request);
                self.state = State::HttpCall;
                Ok(HandleReply::Yield)
            }
        }
    }

    fn respond(&mut self, callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        if self.headers_continued {
            return Err(ScriptError::runtime(
                "respond() cannot be called if headers have been continued",
            ));
        }

        let mut headers = build_headers(
            args.check_table(0)?,
            "respond header values must be strings or arrays of strings",
        )?;
        if !headers.status().is_some_and(|status| (200..=599).contains(&status)) {
            return Err(ScriptError::runtime(":status must be between 200-599"));
        }

        let body = args.opt_bytes(1)?.cloned();
        if let Some(body) = &body {
            headers.set_content_length(body.len());
        }

        callbacks.respond(headers, body)?;
        self.state = State::Responded;
        Ok(HandleReply::Yield)
    }

    fn import_public_key(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let key = args.check_bytes(0)?.clone();
        let valid = self.public_keys.contains_key(&key)
            || match crypto::import_public_key(&key) {
                Some(parsed) => {
                    self.public_keys.insert(key.clone(), parsed);
                    true
                }
                None => {
                    debug!("failed to import public key");
                    false
                }
            };
        let wrapper = PublicKeyWrapper::new(valid.then_some(key));
        Ok(HandleReply::object(self.wrappers.insert(Wrapper::PublicKey(wrapper))))
    }

    fn verify_signature(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let hash = args.check_str(0)?;
        let key = args.check_bytes(1)?;
        let signature = args.check_bytes(2)?;
        let text = args.check_bytes(3)?;

        Ok(HandleReply::Values(
            match crypto::verify_signature(hash, self.public_keys.get(key), signature, text) {
                Ok(()) => vec![Value::Bool(true), "".into()],
                Err(message) => vec![Value::Bool(false), message.into()],
            },
        ))
    }

    fn base64_escape(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let input = args.check_bytes(0)?;
        Ok(HandleReply::value(STANDARD.encode(input)))
    }

    fn timestamp(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        match args.opt_str(0)?.unwrap_or("") {
            "" | "MILLISECOND" | "milliseconds_from_epoch" => {
                let millis = self.time_source.since_epoch().as_millis();
                Ok(HandleReply::value(i64::try_from(millis).unwrap_or(i64::MAX)))
            }
            _ => Err(ScriptError::runtime("timestamp format must be MILLISECOND.")),
        }
    }

    fn timestamp_string(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let since_epoch = self.time_source.since_epoch();
        match args.opt_str(0)?.unwrap_or("") {
            "" | "MILLISECOND" | "milliseconds_from_epoch" => {
                Ok(HandleReply::value(since_epoch.as_millis().to_string()))
            }
            "MICROSECOND" | "microseconds_from_epoch" => {
                Ok(HandleReply::value(since_epoch.as_micros().to_string()))
            }
            _ => Err(ScriptError::runtime(
                "timestamp format must be MILLISECOND or MICROSECOND.",
            )),
        }
    }

    fn set_upstream_override_host(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        args: &Args,
    ) -> Result<HandleReply> {
        let host = args.check_str(0)?;
        let strict = args.opt_bool(1)?.unwrap_or(false);
        if host.parse::<IpAddr>().is_err() && host.parse::<SocketAddr>().is_err() {
            return Err(ScriptError::runtime("host is not a valid IP address"));
        }
        callbacks.set_upstream_override_host(host, strict);
        Ok(HandleReply::none())
    }

    fn clear_route_cache(&mut self, callbacks: &mut dyn FilterCallbacks, _args: &Args) -> Result<HandleReply> {
        callbacks.clear_route_cache();
        Ok(HandleReply::none())
    }

    fn log_trace(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        trace!(script_log = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }

    fn log_debug(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        debug!(script_log = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }

    fn log_info(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        info!(script_log = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }

    fn log_warn(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        warn!(script_log = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }

    fn log_err(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        error!(script_log = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }

    fn log_critical(&mut self, _callbacks: &mut dyn FilterCallbacks, args: &Args) -> Result<HandleReply> {
        let message = log_message(args)?;
        error!(script_log = true, critical = true, entry = %self.entry, "{}", message);
        Ok(HandleReply::none())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(mut request) = self.http_request.take() {
            request.cancel();
        }
    }
}

fn log_message(args: &Args) -> Result<String> {
    Ok(String::from_utf8_lossy(args.check_bytes(0)?).into_owned())
}

/// Header map from a script table; values are strings or arrays of strings
fn build_headers(table: &Table, bad_value: &str) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in table {
        match value {
            Value::String(_) => map.add(key, value_str(value, bad_value)?),
            Value::Array(values) => {
                for value in values {
                    map.add(key, value_str(value, bad_value)?);
                }
            }
            _ => return Err(ScriptError::runtime(bad_value)),
        }
    }
    Ok(map)
}

fn value_str<'v>(value: &'v Value, bad_value: &str) -> Result<&'v str> {
    value.as_str().ok_or_else(|| ScriptError::runtime(bad_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeRuntime, NativeScript, StreamApi};
    use crate::runtime::ScriptRuntime;
    use crate::testing::{FixedTimeSource, MockClusterManager, RecordingCallbacks};
    use octopus_core::headers::CONTENT_LENGTH;
    use std::time::UNIX_EPOCH;

    fn coroutine(script: NativeScript) -> Box<dyn Coroutine> {
        NativeRuntime::new()
            .register("test", script)
            .compile("test", "test")
            .unwrap()
            .instantiate()
            .create_coroutine(EntryPoint::OnRequest)
            .unwrap()
    }

    fn handle(end_stream: bool) -> (StreamHandle, Arc<MockClusterManager>) {
        let clusters = Arc::new(MockClusterManager::new(["cluster_x"]));
        let time = Arc::new(FixedTimeSource::new(
            UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456),
        ));
        let headers = HeaderMap::from_pairs([(":method", "GET"), (":path", "/")]).into_shared();
        let handle = StreamHandle::new(
            EntryPoint::OnRequest,
            headers,
            end_stream,
            clusters.clone(),
            time,
        );
        (handle, clusters)
    }

    fn call_headers() -> Value {
        Value::table([(":method", "GET"), (":path", "/"), (":authority", "x")])
    }

    #[test]
    fn test_method_table_covers_host_surface() {
        let names: Vec<_> = StreamHandle::method_names().collect();
        for name in [
            "headers",
            "body",
            "bodyChunks",
            "trailers",
            "metadata",
            "httpCall",
            "respond",
            "streamInfo",
            "connection",
            "connectionStreamInfo",
            "importPublicKey",
            "verifySignature",
            "base64Escape",
            "timestamp",
            "timestampString",
            "setUpstreamOverrideHost",
            "clearRouteCache",
            "filterContext",
            "virtualHost",
            "logCritical",
        ] {
            assert!(names.contains(&name), "missing {}", name);
        }
    }

    #[test]
    fn test_script_without_yield_continues() {
        let (mut handle, _) = handle(true);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            let headers = api.headers().await?;
            headers.call("add", vec!["x-script".into(), "1".into()]).await?;
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        let status = handle.start(co.as_mut(), &mut cb).unwrap();
        assert_eq!(status, FilterHeadersStatus::Continue);
        assert!(handle.headers_continued());
        assert_eq!(handle.live_wrappers(), 0);
        assert_eq!(handle.headers.borrow().get("x-script"), Some("1"));
        assert_eq!(cb.headers_modified, 1);
    }

    #[test]
    fn test_body_after_streaming_is_an_error() {
        let (mut handle, _) = handle(false);
        handle.saw_body = true;
        let mut cb = RecordingCallbacks::default();
        let err = handle.body(&mut cb, &Args::default()).unwrap_err();
        assert_eq!(err.message(), "cannot call body() after body streaming has started");

        handle.end_stream = true;
        let err = handle.body(&mut cb, &Args::default()).unwrap_err();
        assert_eq!(err.message(), "cannot call body() after body has been streamed");
    }

    #[test]
    fn test_body_at_end_without_data() {
        let (mut handle, _) = handle(true);
        let mut cb = RecordingCallbacks::default();

        match handle.body(&mut cb, &Args::default()).unwrap() {
            HandleReply::Values(values) => assert!(values[0].is_nil()),
            HandleReply::Yield => panic!("unexpected yield"),
        }
        match handle.body(&mut cb, &Args::new(vec![Value::Bool(true)])).unwrap() {
            HandleReply::Values(values) => assert!(values[0].as_object().is_some()),
            HandleReply::Yield => panic!("unexpected yield"),
        }
    }

    #[test]
    fn test_body_chunks_rewrites_chunks_in_place() {
        let (mut handle, _) = handle(false);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            let chunks = api.body_chunks().await?;
            while let Some((chunk, _end_stream)) = chunks.next().await? {
                let len = chunk.call_first("length", vec![]).await?.as_integer().unwrap_or(0);
                chunk.call("setBytes", vec!["x".repeat(len as usize).into()]).await?;
            }
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        assert_eq!(handle.start(co.as_mut(), &mut cb).unwrap(), FilterHeadersStatus::Continue);
        assert_eq!(handle.state(), State::WaitForBodyChunk);

        let mut data = BytesMut::from("abc");
        let status = handle.on_data(co.as_mut(), &mut cb, &mut data, false).unwrap();
        assert_eq!(status, FilterDataStatus::StopIterationNoBuffer);
        assert_eq!(handle.state(), State::WaitForBodyChunk);
        assert_eq!(&data[..], b"xxx");
        assert_eq!(handle.live_wrappers(), 0);

        let mut data = BytesMut::from("de");
        let status = handle.on_data(co.as_mut(), &mut cb, &mut data, true).unwrap();
        assert_eq!(status, FilterDataStatus::Continue);
        assert_eq!(&data[..], b"xx");
        assert_eq!(handle.state(), State::Running);
        assert_eq!(handle.headers.borrow().get(CONTENT_LENGTH), Some("2"));
    }

    #[test]
    fn test_body_chunks_continue_once_script_stops_reading() {
        let (mut handle, _) = handle(false);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            let chunks = api.body_chunks().await?;
            if let Some((chunk, _end_stream)) = chunks.next().await? {
                chunk.call("setBytes", vec!["first".into()]).await?;
            }
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        handle.start(co.as_mut(), &mut cb).unwrap();
        assert_eq!(handle.state(), State::WaitForBodyChunk);

        let mut data = BytesMut::from("ab");
        let status = handle.on_data(co.as_mut(), &mut cb, &mut data, false).unwrap();
        assert_eq!(status, FilterDataStatus::Continue);
        assert_eq!(&data[..], b"first");
        assert_eq!(handle.state(), State::Running);

        let mut data = BytesMut::from("cd");
        let status = handle.on_data(co.as_mut(), &mut cb, &mut data, false).unwrap();
        assert_eq!(status, FilterDataStatus::Continue);
        assert_eq!(&data[..], b"cd");
    }

    #[test]
    fn test_trailers_wait_and_resume() {
        let (mut handle, _) = handle(false);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            let trailers = api.trailers().await?.expect("trailers");
            let value = trailers.get_str("grpc-status").await?.unwrap_or_default();
            api.log_info(&format!("grpc-status {}", value)).await?;
            trailers.call("add", vec!["x-seen".into(), value.into()]).await?;
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        assert_eq!(handle.start(co.as_mut(), &mut cb).unwrap(), FilterHeadersStatus::Continue);
        assert_eq!(handle.state(), State::WaitForTrailers);

        let mut data = BytesMut::from("body");
        let status = handle.on_data(co.as_mut(), &mut cb, &mut data, false).unwrap();
        assert_eq!(status, FilterDataStatus::Continue);
        assert_eq!(handle.state(), State::WaitForTrailers);

        let trailers = HeaderMap::from_pairs([("grpc-status", "0")]).into_shared();
        let status = handle.on_trailers(co.as_mut(), &mut cb, trailers.clone()).unwrap();
        assert_eq!(status, FilterTrailersStatus::Continue);
        assert_eq!(trailers.borrow().get("x-seen"), Some("0"));
    }

    #[test]
    fn test_trailers_nil_when_stream_ends_without_them() {
        let (mut handle, _) = handle(false);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            if api.trailers().await?.is_none() {
                api.call("logDebug", vec!["no trailers".into()]).await?;
            }
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        handle.start(co.as_mut(), &mut cb).unwrap();
        let mut data = BytesMut::from("last");
        handle.on_data(co.as_mut(), &mut cb, &mut data, true).unwrap();
        assert_eq!(handle.state(), State::Running);
        assert_eq!(co.status(), crate::runtime::CoroutineStatus::Dead);
    }

    #[test]
    fn test_http_call_validation() {
        let (mut handle, clusters) = handle(true);
        let mut cb = RecordingCallbacks::default();
        let cases = [
            (
                vec!["cluster_x".into(), call_headers(), Value::Nil, 0.into(), "yes".into()],
                "http call asynchronous flag must be 'true', 'false', or empty",
            ),
            (
                vec!["".into(), call_headers(), Value::Nil, 0.into()],
                "http call cluster invalid. Must be configured",
            ),
            (
                vec!["cluster_y".into(), call_headers(), Value::Nil, 0.into()],
                "http call cluster invalid. Must be configured",
            ),
            (
                vec![
                    "cluster_x".into(),
                    Value::table([(":method", Value::from("GET")), (":path", Value::from(1))]),
                    Value::Nil,
                    0.into(),
                ],
                "http call header values must be strings or arrays of strings",
            ),
            (
                vec![
                    "cluster_x".into(),
                    Value::table([(":method", "GET"), (":path", "/")]),
                    Value::Nil,
                    0.into(),
                ],
                "http call headers must include ':path', ':method', and ':authority'",
            ),
            (
                vec!["cluster_x".into(), call_headers(), Value::Nil, (-1).into()],
                "http call timeout must be >= 0",
            ),
        ];

        for (args, message) in cases {
            let err = handle.http_call(&mut cb, &Args::new(args)).unwrap_err();
            assert_eq!(err.message(), message);
        }
        assert!(clusters.requests().is_empty());
        assert_eq!(handle.state(), State::Running);
    }

    #[test]
    fn test_http_call_sets_content_length_and_options() {
        let (mut handle, clusters) = handle(true);
        let mut cb = RecordingCallbacks::default();
        let args = Args::new(vec![
            "cluster_x".into(),
            call_headers(),
            "payload".into(),
            250.into(),
        ]);

        assert!(matches!(handle.http_call(&mut cb, &args).unwrap(), HandleReply::Yield));
        assert_eq!(handle.state(), State::HttpCall);
        assert!(handle.pending_call_id().is_some());

        let requests = clusters.requests();
        let (cluster, request, timeout) = &requests[0];
        assert_eq!(cluster, "cluster_x");
        assert_eq!(request.headers.get(CONTENT_LENGTH), Some("7"));
        assert_eq!(request.body.as_deref(), Some(&b"payload"[..]));
        assert_eq!(*timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_async_http_call_does_not_yield() {
        let (mut handle, clusters) = handle(true);
        let mut cb = RecordingCallbacks::default();
        let args = Args::new(vec![
            "cluster_x".into(),
            call_headers(),
            Value::Nil,
            0.into(),
            Value::table([("asynchronous", true)]),
        ]);

        match handle.http_call(&mut cb, &args).unwrap() {
            HandleReply::Values(values) => assert!(values.is_empty()),
            HandleReply::Yield => panic!("asynchronous call must not yield"),
        }
        assert_eq!(handle.state(), State::Running);
        assert!(handle.pending_call_id().is_none());
        assert_eq!(clusters.requests()[0].2, None);
    }

    #[test]
    fn test_duplicate_response_headers() {
        let (mut handle, _) = handle(true);
        let response = HttpCallResponse {
            headers: HeaderMap::from_pairs([(":status", "200"), ("set-cookie", "a"), ("set-cookie", "b")]),
            body: Bytes::new(),
        };

        let values = handle.call_outcome(Ok(response.clone()));
        let table = values[0].as_table().unwrap();
        assert_eq!(table.get("set-cookie").and_then(Value::as_str), Some("b"));
        assert!(values[1].is_nil());

        handle.return_duplicate_headers = true;
        let values = handle.call_outcome(Ok(response));
        let cookies = values[0].as_table().unwrap().get("set-cookie").unwrap();
        assert_eq!(cookies.as_array().unwrap().len(), 2);

        let values = handle.call_outcome(Err(FailureReason::Timeout));
        assert!(values[0].is_nil());
        assert_eq!(values[1].as_str(), Some("timeout"));
    }

    #[test]
    fn test_completion_after_reset_is_dropped() {
        let (mut handle, clusters) = handle(true);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            api.http_call("cluster_x", call_headers(), None, 0).await?;
            api.log_info("resumed").await?;
            Ok(())
        }));
        let mut cb = RecordingCallbacks::default();

        assert_eq!(handle.start(co.as_mut(), &mut cb).unwrap(), FilterHeadersStatus::StopIteration);
        let id = handle.pending_call_id().unwrap();

        handle.on_reset();
        assert_eq!(clusters.cancelled(), vec![id]);
        assert!(handle.pending_call_id().is_none());

        handle
            .on_http_call_complete(co.as_mut(), &mut cb, Ok(HttpCallResponse::default()))
            .unwrap();
        assert_eq!(cb.continued, 0);
        assert_eq!(co.status(), crate::runtime::CoroutineStatus::Suspended);
    }

    #[test]
    fn test_drop_cancels_outstanding_call() {
        let (mut handle, clusters) = handle(true);
        let mut cb = RecordingCallbacks::default();
        let args = Args::new(vec!["cluster_x".into(), call_headers(), Value::Nil, 0.into()]);
        handle.http_call(&mut cb, &args).unwrap();
        let id = handle.pending_call_id().unwrap();

        drop(handle);
        assert_eq!(clusters.cancelled(), vec![id]);
    }

    #[test]
    fn test_respond_validation() {
        let (mut handle, _) = handle(true);
        let mut cb = RecordingCallbacks::default();

        let err = handle
            .respond(&mut cb, &Args::new(vec![Value::table([(":status", "700")])]))
            .unwrap_err();
        assert_eq!(err.message(), ":status must be between 200-599");

        handle.headers_continued = true;
        let err = handle
            .respond(&mut cb, &Args::new(vec![Value::table([(":status", "200")])]))
            .unwrap_err();
        assert_eq!(err.message(), "respond() cannot be called if headers have been continued");
        assert!(cb.responses.is_empty());
    }

    #[test]
    fn test_sync_helpers() {
        let (mut handle, _) = handle(true);
        let mut cb = RecordingCallbacks::default();

        let value = |reply: HandleReply| match reply {
            HandleReply::Values(mut values) => values.remove(0),
            HandleReply::Yield => panic!("unexpected yield"),
        };

        let escaped = value(handle.base64_escape(&mut cb, &Args::new(vec!["hello".into()])).unwrap());
        assert_eq!(escaped.as_str(), Some("aGVsbG8="));

        let millis = value(handle.timestamp(&mut cb, &Args::default()).unwrap());
        assert_eq!(millis.as_integer(), Some(1_700_000_000_123));
        let err = handle
            .timestamp(&mut cb, &Args::new(vec!["MICROSECOND".into()]))
            .unwrap_err();
        assert_eq!(err.message(), "timestamp format must be MILLISECOND.");

        let micros = value(
            handle
                .timestamp_string(&mut cb, &Args::new(vec!["MICROSECOND".into()]))
                .unwrap(),
        );
        assert_eq!(micros.as_str(), Some("1700000000123456"));
        let err = handle
            .timestamp_string(&mut cb, &Args::new(vec!["SECOND".into()]))
            .unwrap_err();
        assert_eq!(err.message(), "timestamp format must be MILLISECOND or MICROSECOND.");
    }

    #[test]
    fn test_set_upstream_override_host() {
        let (mut handle, _) = handle(true);
        let mut cb = RecordingCallbacks::default();

        let err = handle
            .set_upstream_override_host(&mut cb, &Args::new(vec!["example.com".into()]))
            .unwrap_err();
        assert_eq!(err.message(), "host is not a valid IP address");

        handle
            .set_upstream_override_host(
                &mut cb,
                &Args::new(vec!["10.0.0.1:8080".into(), Value::Bool(true)]),
            )
            .unwrap();
        assert_eq!(cb.override_host, Some(("10.0.0.1:8080".to_string(), true)));
    }

    #[test]
    fn test_import_public_key_and_verify() {
        let (mut handle, _) = handle(true);
        let mut cb = RecordingCallbacks::default();

        handle
            .import_public_key(&mut cb, &Args::new(vec!["garbage".into()]))
            .unwrap();
        assert!(handle.public_keys.is_empty());

        let reply = handle
            .verify_signature(
                &mut cb,
                &Args::new(vec!["sha256".into(), "garbage".into(), "sig".into(), "text".into()]),
            )
            .unwrap();
        match reply {
            HandleReply::Values(values) => {
                assert_eq!(values[0], Value::Bool(false));
                assert_eq!(values[1].as_str(), Some("Failed to initialize digest verify."));
            }
            HandleReply::Yield => panic!("unexpected yield"),
        }
    }

    #[test]
    fn test_stale_wrapper_raises_out_of_scope() {
        let (mut handle, _) = handle(false);
        let mut co = coroutine(NativeScript::new().on_request(|api: StreamApi| async move {
            let headers = api.headers().await?;
            api.body().await?;
            match headers.call_first("get", vec![":path".into()]).await {
                Err(err) => {
                    api.log_info(err.message()).await?;
                    Ok(())
                }
                Ok(_) => Err(ScriptError::runtime("stale wrapper was usable")),
            }
        }));
        let mut cb = RecordingCallbacks::default();

        assert_eq!(handle.start(co.as_mut(), &mut cb).unwrap(), FilterHeadersStatus::StopIteration);
        assert_eq!(handle.live_wrappers(), 0);

        let mut data = BytesMut::from("x");
        handle.on_data(co.as_mut(), &mut cb, &mut data, true).unwrap();
        assert_eq!(co.status(), crate::runtime::CoroutineStatus::Dead);
    }
}
