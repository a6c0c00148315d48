//! Test doubles for the proxy side of the filter
//!
//! Enabled for unit tests and behind the `testing` feature so integration tests and
//! embedding proxies can drive a [`ScriptFilter`](crate::ScriptFilter) without a real proxy.

use crate::callbacks::{FilterCallbacks, CANONICAL_FILTER_NAME};
use crate::error::{Result, ScriptError};
use bytes::{Bytes, BytesMut};
use octopus_core::{
    AsyncRequest, CallDispatch, CallId, ClusterManager, Connection, Error, FailureReason,
    FilterDataStatus, HeaderMap, HttpCallRequest, HttpCallResponse, LocalReply, RequestOptions,
    StreamDecoderFilterCallbacks, StreamEncoderFilterCallbacks, StreamFilterCallbacks,
    StreamInfo, Struct, TimeSource,
};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// [`FilterCallbacks`] that records every interaction
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    /// Buffered body
    pub buffer: Option<BytesMut>,
    /// Stream info handed to the script
    pub stream_info: StreamInfo,
    /// Downstream connection
    pub connection: Option<Connection>,
    /// Route metadata returned by `metadata()`
    pub metadata: Struct,
    /// Per-route filter context
    pub filter_context: Struct,
    /// Name the filter was configured under
    pub config_name: String,
    /// Header modification notifications
    pub headers_modified: usize,
    /// Continue-iteration calls
    pub continued: usize,
    /// Route cache clears
    pub route_cache_clears: usize,
    /// Local replies sent
    pub responses: Vec<(HeaderMap, Option<Bytes>)>,
    /// Fail `respond` like the response path does
    pub reject_respond: bool,
    /// Last upstream override
    pub override_host: Option<(String, bool)>,
}

impl FilterCallbacks for RecordingCallbacks {
    fn add_data(&mut self, data: &[u8]) {
        self.buffer
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(data);
    }

    fn buffered_body(&self) -> Option<Bytes> {
        self.buffer.as_ref().map(|buffer| buffer.clone().freeze())
    }

    fn modify_buffered_body(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        modify(self.buffer.get_or_insert_with(BytesMut::new));
    }

    fn continue_iteration(&mut self) {
        self.continued += 1;
    }

    fn on_headers_modified(&mut self) {
        self.headers_modified += 1;
    }

    fn respond(&mut self, headers: HeaderMap, body: Option<Bytes>) -> Result<()> {
        if self.reject_respond {
            return Err(ScriptError::runtime(
                "respond not currently supported in the response path",
            ));
        }
        self.responses.push((headers, body));
        Ok(())
    }

    fn metadata(&self) -> Struct {
        self.metadata.clone()
    }

    fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo {
        &mut self.stream_info
    }

    fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    fn active_span(&self) -> tracing::Span {
        tracing::Span::none()
    }

    fn set_upstream_override_host(&mut self, host: &str, strict: bool) {
        self.override_host = Some((host.to_string(), strict));
    }

    fn clear_route_cache(&mut self) {
        self.route_cache_clears += 1;
    }

    fn filter_context(&self) -> &Struct {
        &self.filter_context
    }

    fn filter_config_name(&self) -> &str {
        &self.config_name
    }
}

/// What the proxy saw from one direction of a mocked stream
#[derive(Debug, Default)]
pub struct MockRecorder {
    /// Proxy-side buffer
    pub buffer: Option<BytesMut>,
    /// Local replies sent
    pub local_replies: Vec<LocalReply>,
    /// Continue-iteration calls
    pub continued: usize,
    /// Route cache clears
    pub route_cache_clears: usize,
    /// Last upstream override
    pub override_host: Option<(String, bool)>,
}

impl MockRecorder {
    /// Buffer `data` the way the proxy does when a filter answers `status`
    pub fn buffer_data(&mut self, status: FilterDataStatus, data: &[u8]) {
        if status == FilterDataStatus::StopIterationAndBuffer {
            self.buffer
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(data);
        }
    }

    /// Buffered body as bytes
    pub fn buffered(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    fn modify(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        modify(self.buffer.get_or_insert_with(BytesMut::new));
    }
}

macro_rules! stream_filter_callbacks {
    ($mock:ty) => {
        impl StreamFilterCallbacks for $mock {
            fn stream_info(&self) -> &StreamInfo {
                &self.stream_info
            }

            fn stream_info_mut(&mut self) -> &mut StreamInfo {
                &mut self.stream_info
            }

            fn connection(&self) -> Option<&Connection> {
                self.connection.as_ref()
            }

            fn active_span(&self) -> tracing::Span {
                tracing::Span::none()
            }

            fn filter_config_name(&self) -> &str {
                &self.config_name
            }

            fn most_specific_per_filter_config(&self) -> Option<Arc<dyn Any + Send + Sync>> {
                self.per_route.clone()
            }
        }
    };
}

/// Mocked request path callbacks
#[derive(Debug)]
pub struct MockDecoderCallbacks {
    /// Stream info
    pub stream_info: StreamInfo,
    /// Downstream connection
    pub connection: Option<Connection>,
    /// Name the filter was configured under
    pub config_name: String,
    /// Per-route config returned to the filter
    pub per_route: Option<Arc<dyn Any + Send + Sync>>,
    recorder: Rc<RefCell<MockRecorder>>,
}

impl MockDecoderCallbacks {
    /// Mock with empty stream info
    pub fn new() -> Self {
        Self {
            stream_info: StreamInfo::default(),
            connection: None,
            config_name: CANONICAL_FILTER_NAME.to_string(),
            per_route: None,
            recorder: Rc::default(),
        }
    }

    /// Shared view of what the proxy saw
    pub fn recorder(&self) -> Rc<RefCell<MockRecorder>> {
        self.recorder.clone()
    }
}

impl Default for MockDecoderCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

stream_filter_callbacks!(MockDecoderCallbacks);

impl StreamDecoderFilterCallbacks for MockDecoderCallbacks {
    fn add_decoded_data(&mut self, data: &[u8]) {
        self.recorder
            .borrow_mut()
            .buffer
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(data);
    }

    fn decoding_buffer(&self) -> Option<Bytes> {
        let recorder = self.recorder.borrow();
        recorder.buffer.as_ref().map(|buffer| buffer.clone().freeze())
    }

    fn modify_decoding_buffer(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        self.recorder.borrow_mut().modify(modify);
    }

    fn continue_decoding(&mut self) {
        self.recorder.borrow_mut().continued += 1;
    }

    fn send_local_reply(&mut self, reply: LocalReply) {
        self.recorder.borrow_mut().local_replies.push(reply);
    }

    fn set_upstream_override_host(&mut self, host: &str, strict: bool) {
        self.recorder.borrow_mut().override_host = Some((host.to_string(), strict));
    }

    fn clear_route_cache(&mut self) {
        self.recorder.borrow_mut().route_cache_clears += 1;
    }
}

/// Mocked response path callbacks
#[derive(Debug)]
pub struct MockEncoderCallbacks {
    /// Stream info
    pub stream_info: StreamInfo,
    /// Downstream connection
    pub connection: Option<Connection>,
    /// Name the filter was configured under
    pub config_name: String,
    /// Per-route config returned to the filter
    pub per_route: Option<Arc<dyn Any + Send + Sync>>,
    recorder: Rc<RefCell<MockRecorder>>,
}

impl MockEncoderCallbacks {
    /// Mock with empty stream info
    pub fn new() -> Self {
        Self {
            stream_info: StreamInfo::default(),
            connection: None,
            config_name: CANONICAL_FILTER_NAME.to_string(),
            per_route: None,
            recorder: Rc::default(),
        }
    }

    /// Shared view of what the proxy saw
    pub fn recorder(&self) -> Rc<RefCell<MockRecorder>> {
        self.recorder.clone()
    }
}

impl Default for MockEncoderCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

stream_filter_callbacks!(MockEncoderCallbacks);

impl StreamEncoderFilterCallbacks for MockEncoderCallbacks {
    fn add_encoded_data(&mut self, data: &[u8]) {
        self.recorder
            .borrow_mut()
            .buffer
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(data);
    }

    fn encoding_buffer(&self) -> Option<Bytes> {
        let recorder = self.recorder.borrow();
        recorder.buffer.as_ref().map(|buffer| buffer.clone().freeze())
    }

    fn modify_encoding_buffer(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        self.recorder.borrow_mut().modify(modify);
    }

    fn continue_encoding(&mut self) {
        self.recorder.borrow_mut().continued += 1;
    }
}

type SentRequest = (String, HttpCallRequest, Option<Duration>);

#[derive(Debug, Default)]
struct ClusterLog {
    next_id: CallId,
    requests: Vec<SentRequest>,
    cancelled: Vec<CallId>,
    inline: VecDeque<std::result::Result<HttpCallResponse, FailureReason>>,
}

/// [`ClusterManager`] that records calls instead of sending them
///
/// Calls stay pending unless an inline outcome was queued with
/// [`complete_inline`](Self::complete_inline).
#[derive(Debug)]
pub struct MockClusterManager {
    clusters: HashSet<String>,
    log: Arc<Mutex<ClusterLog>>,
}

impl MockClusterManager {
    /// Manager knowing `clusters`
    pub fn new<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clusters: clusters.into_iter().map(Into::into).collect(),
            log: Arc::new(Mutex::new(ClusterLog {
                next_id: 1,
                ..ClusterLog::default()
            })),
        }
    }

    /// Complete the next call before `send` returns
    pub fn complete_inline(&self, outcome: std::result::Result<HttpCallResponse, FailureReason>) {
        self.log.lock().inline.push_back(outcome);
    }

    /// Calls sent so far
    pub fn requests(&self) -> Vec<SentRequest> {
        self.log.lock().requests.clone()
    }

    /// Calls cancelled so far
    pub fn cancelled(&self) -> Vec<CallId> {
        self.log.lock().cancelled.clone()
    }

    /// Identifier of the last pending call
    pub fn last_call_id(&self) -> Option<CallId> {
        let log = self.log.lock();
        (log.next_id > 1).then(|| log.next_id - 1)
    }
}

impl ClusterManager for MockClusterManager {
    fn has_cluster(&self, name: &str) -> bool {
        self.clusters.contains(name)
    }

    fn send(
        &self,
        cluster: &str,
        request: HttpCallRequest,
        options: RequestOptions,
    ) -> octopus_core::Result<CallDispatch> {
        if !self.has_cluster(cluster) {
            return Err(Error::UnknownCluster(cluster.to_string()));
        }

        let mut log = self.log.lock();
        log.requests
            .push((cluster.to_string(), request, options.timeout));
        if let Some(outcome) = log.inline.pop_front() {
            return Ok(CallDispatch::Completed(outcome));
        }

        let id = log.next_id;
        log.next_id += 1;
        Ok(CallDispatch::Pending(Box::new(MockRequest {
            id,
            log: self.log.clone(),
        })))
    }
}

#[derive(Debug)]
struct MockRequest {
    id: CallId,
    log: Arc<Mutex<ClusterLog>>,
}

impl AsyncRequest for MockRequest {
    fn id(&self) -> CallId {
        self.id
    }

    fn cancel(&mut self) {
        self.log.lock().cancelled.push(self.id);
    }
}

/// [`TimeSource`] frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    now: SystemTime,
}

impl FixedTimeSource {
    /// Clock stopped at `now`
    pub fn new(now: SystemTime) -> Self {
        Self { now }
    }
}

impl TimeSource for FixedTimeSource {
    fn system_time(&self) -> SystemTime {
        self.now
    }
}
