//! The script filter
//!
//! [`ScriptFilter`] is created per stream. It resolves which script runs for the stream, owns
//! one coroutine and one [`StreamHandle`] per direction, and turns the proxy's six lifecycle
//! calls into handle operations.

use crate::callbacks::{DecoderCallbacks, EncoderCallbacks, FilterCallbacks};
use crate::config::{ErrorPolicy, FilterConfig, FilterConfigPerRoute, PerScriptSetup};
use crate::error::ScriptError;
use crate::handle::StreamHandle;
use crate::runtime::{Coroutine, EntryPoint};
use bytes::BytesMut;
use http::StatusCode;
use octopus_core::{
    CallCompletion, FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, HeaderMap,
    LocalReply, SharedHeaderMap, StreamDecoderFilterCallbacks, StreamEncoderFilterCallbacks,
    Struct, SystemTimeSource, TimeSource,
};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Details recorded for the local reply sent when a script fails
pub const SCRIPT_ERROR_DETAILS: &str = "script_error";

#[derive(Debug)]
struct StreamPair {
    handle: StreamHandle,
    coroutine: Box<dyn Coroutine>,
}

/// Per-stream script filter
#[derive(Debug)]
pub struct ScriptFilter {
    config: Arc<FilterConfig>,
    worker: usize,
    time_source: Arc<dyn TimeSource>,
    decoder_callbacks: Option<Box<dyn StreamDecoderFilterCallbacks>>,
    encoder_callbacks: Option<Box<dyn StreamEncoderFilterCallbacks>>,
    resolved: bool,
    setup: Option<Arc<PerScriptSetup>>,
    filter_context: Struct,
    request: Option<StreamPair>,
    response: Option<StreamPair>,
    destroyed: bool,
}

impl ScriptFilter {
    /// Filter for a stream running on `worker`
    pub fn new(config: Arc<FilterConfig>, worker: usize) -> Self {
        Self {
            config,
            worker,
            time_source: Arc::new(SystemTimeSource),
            decoder_callbacks: None,
            encoder_callbacks: None,
            resolved: false,
            setup: None,
            filter_context: Struct::new(),
            request: None,
            response: None,
            destroyed: false,
        }
    }

    /// Replace the clock scripts read
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Attach the request path callbacks
    pub fn set_decoder_filter_callbacks(&mut self, callbacks: Box<dyn StreamDecoderFilterCallbacks>) {
        self.decoder_callbacks = Some(callbacks);
    }

    /// Attach the response path callbacks
    pub fn set_encoder_filter_callbacks(&mut self, callbacks: Box<dyn StreamEncoderFilterCallbacks>) {
        self.encoder_callbacks = Some(callbacks);
    }

    /// Request path callbacks
    pub fn decoder_callbacks(&self) -> Option<&dyn StreamDecoderFilterCallbacks> {
        self.decoder_callbacks.as_deref()
    }

    /// Response path callbacks
    pub fn encoder_callbacks(&self) -> Option<&dyn StreamEncoderFilterCallbacks> {
        self.encoder_callbacks.as_deref()
    }

    /// Stream handle of one direction, once its headers started a script
    pub fn handle(&self, entry: EntryPoint) -> Option<&StreamHandle> {
        self.pair(entry).map(|pair| &pair.handle)
    }

    /// Name of the script resolved for the stream
    pub fn script_name(&self) -> Option<&str> {
        self.setup.as_deref().map(PerScriptSetup::name)
    }

    /// Request headers
    pub fn decode_headers(&mut self, headers: &SharedHeaderMap, end_stream: bool) -> FilterHeadersStatus {
        let status = self.do_headers(EntryPoint::OnRequest, headers, end_stream);
        self.invalidate_wrappers();
        status
    }

    /// Request body chunk
    pub fn decode_data(&mut self, data: &mut BytesMut, end_stream: bool) -> FilterDataStatus {
        let status = self.do_data(EntryPoint::OnRequest, data, end_stream);
        self.invalidate_wrappers();
        status
    }

    /// Request trailers
    pub fn decode_trailers(&mut self, trailers: &SharedHeaderMap) -> FilterTrailersStatus {
        let status = self.do_trailers(EntryPoint::OnRequest, trailers);
        self.invalidate_wrappers();
        status
    }

    /// Response headers
    pub fn encode_headers(&mut self, headers: &SharedHeaderMap, end_stream: bool) -> FilterHeadersStatus {
        let status = self.do_headers(EntryPoint::OnResponse, headers, end_stream);
        self.invalidate_wrappers();
        status
    }

    /// Response body chunk
    pub fn encode_data(&mut self, data: &mut BytesMut, end_stream: bool) -> FilterDataStatus {
        let status = self.do_data(EntryPoint::OnResponse, data, end_stream);
        self.invalidate_wrappers();
        status
    }

    /// Response trailers
    pub fn encode_trailers(&mut self, trailers: &SharedHeaderMap) -> FilterTrailersStatus {
        let status = self.do_trailers(EntryPoint::OnResponse, trailers);
        self.invalidate_wrappers();
        status
    }

    /// Deliver the outcome of a call issued by one of the scripts
    pub fn on_http_call_complete(&mut self, completion: CallCompletion) {
        let CallCompletion { id, outcome } = completion;
        let entry = [EntryPoint::OnRequest, EntryPoint::OnResponse]
            .into_iter()
            .find(|entry| self.handle(*entry).and_then(StreamHandle::pending_call_id) == Some(id));
        let Some(entry) = entry else {
            debug!(id, "no stream waiting on call");
            return;
        };

        let result = self.with_stream(entry, |pair, callbacks| {
            pair.handle
                .on_http_call_complete(pair.coroutine.as_mut(), callbacks, outcome)
        });
        if let Some(Err(err)) = result {
            self.script_error(entry, err);
        }
        self.invalidate_wrappers();
    }

    /// The stream was reset; outstanding calls are cancelled and scripts never run again
    pub fn on_stream_reset(&mut self) {
        for pair in [self.request.as_mut(), self.response.as_mut()].into_iter().flatten() {
            pair.handle.on_reset();
        }
    }

    /// Tear the filter down
    pub fn on_destroy(&mut self) {
        self.destroyed = true;
        self.on_stream_reset();
        self.request = None;
        self.response = None;
    }

    fn pair(&self, entry: EntryPoint) -> Option<&StreamPair> {
        match entry {
            EntryPoint::OnRequest => self.request.as_ref(),
            EntryPoint::OnResponse => self.response.as_ref(),
        }
    }

    fn pair_slot(&mut self, entry: EntryPoint) -> &mut Option<StreamPair> {
        match entry {
            EntryPoint::OnRequest => &mut self.request,
            EntryPoint::OnResponse => &mut self.response,
        }
    }

    /// Script for the stream, resolved once from the most specific route config
    fn resolve(&mut self) -> Option<Arc<PerScriptSetup>> {
        if !self.resolved {
            self.resolved = true;
            let per_route = self
                .decoder_callbacks
                .as_ref()
                .and_then(|callbacks| callbacks.most_specific_per_filter_config())
                .or_else(|| {
                    self.encoder_callbacks
                        .as_ref()
                        .and_then(|callbacks| callbacks.most_specific_per_filter_config())
                })
                .and_then(|config| config.downcast::<FilterConfigPerRoute>().ok());

            self.setup = match per_route.as_deref() {
                Some(route) if route.disabled() => {
                    debug!("script filter disabled on route");
                    None
                }
                Some(route) if route.name().is_some() => {
                    let name = route.name().unwrap_or_default();
                    let setup = self.config.named_script(name).cloned();
                    if setup.is_none() {
                        debug!(script = name, "route names an unknown script");
                    }
                    setup
                }
                Some(route) if route.setup().is_some() => route.setup().cloned(),
                _ => self.config.default_script().cloned(),
            };
            if let Some(route) = per_route {
                self.filter_context = route.filter_context().clone();
            }
        }
        self.setup.clone()
    }

    /// Run `f` against one direction's pair and its callbacks adapter
    fn with_stream<R>(
        &mut self,
        entry: EntryPoint,
        f: impl FnOnce(&mut StreamPair, &mut dyn FilterCallbacks) -> R,
    ) -> Option<R> {
        let Self {
            config,
            decoder_callbacks,
            encoder_callbacks,
            filter_context,
            request,
            response,
            ..
        } = self;

        match entry {
            EntryPoint::OnRequest => {
                let pair = request.as_mut()?;
                let inner = decoder_callbacks.as_deref_mut()?;
                let mut callbacks =
                    DecoderCallbacks::new(inner, config.clear_route_cache(), filter_context);
                Some(f(pair, &mut callbacks))
            }
            EntryPoint::OnResponse => {
                let pair = response.as_mut()?;
                let inner = encoder_callbacks.as_deref_mut()?;
                let mut callbacks = EncoderCallbacks::new(inner, filter_context);
                Some(f(pair, &mut callbacks))
            }
        }
    }

    fn do_headers(
        &mut self,
        entry: EntryPoint,
        headers: &SharedHeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        if self.destroyed {
            return FilterHeadersStatus::Continue;
        }
        let Some(setup) = self.resolve() else {
            return FilterHeadersStatus::Continue;
        };
        let Some(state) = setup.state(self.worker) else {
            warn!(worker = self.worker, script = setup.name(), "no script state for worker");
            return FilterHeadersStatus::Continue;
        };
        let Some(coroutine) = state.create_coroutine(entry) else {
            trace!(script = setup.name(), %entry, "script has no entry point");
            return FilterHeadersStatus::Continue;
        };

        let handle = StreamHandle::new(
            entry,
            headers.clone(),
            end_stream,
            self.config.cluster_manager().clone(),
            self.time_source.clone(),
        );
        *self.pair_slot(entry) = Some(StreamPair { handle, coroutine });
        debug!(script = setup.name(), %entry, "starting script");

        match self.with_stream(entry, |pair, callbacks| {
            pair.handle.start(pair.coroutine.as_mut(), callbacks)
        }) {
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                if self.script_error(entry, err) {
                    FilterHeadersStatus::LocalReplySent
                } else {
                    FilterHeadersStatus::Continue
                }
            }
            None => {
                warn!(%entry, "callbacks not set, skipping script");
                *self.pair_slot(entry) = None;
                FilterHeadersStatus::Continue
            }
        }
    }

    fn do_data(&mut self, entry: EntryPoint, data: &mut BytesMut, end_stream: bool) -> FilterDataStatus {
        match self.with_stream(entry, |pair, callbacks| {
            pair.handle
                .on_data(pair.coroutine.as_mut(), callbacks, data, end_stream)
        }) {
            None => FilterDataStatus::Continue,
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                if self.script_error(entry, err) {
                    FilterDataStatus::StopIterationNoBuffer
                } else {
                    FilterDataStatus::Continue
                }
            }
        }
    }

    fn do_trailers(&mut self, entry: EntryPoint, trailers: &SharedHeaderMap) -> FilterTrailersStatus {
        match self.with_stream(entry, |pair, callbacks| {
            pair.handle
                .on_trailers(pair.coroutine.as_mut(), callbacks, trailers.clone())
        }) {
            None => FilterTrailersStatus::Continue,
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                if self.script_error(entry, err) {
                    FilterTrailersStatus::StopIteration
                } else {
                    FilterTrailersStatus::Continue
                }
            }
        }
    }

    /// Count and log a script failure, then drop the scripts for the rest of the stream
    ///
    /// Returns whether a local reply was sent.
    fn script_error(&mut self, entry: EntryPoint, err: ScriptError) -> bool {
        self.config.stats().errors.inc();
        error!(
            script = self.script_name().unwrap_or_default(),
            %entry,
            error = %err,
            "script error"
        );

        let headers_continued = self
            .handle(entry)
            .map_or(true, StreamHandle::headers_continued);
        self.request = None;
        self.response = None;

        if self.config.error_policy() != ErrorPolicy::LocalReply
            || entry != EntryPoint::OnRequest
            || headers_continued
        {
            return false;
        }
        let Some(callbacks) = self.decoder_callbacks.as_deref_mut() else {
            return false;
        };
        callbacks.send_local_reply(LocalReply {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::from_pairs([(octopus_core::headers::STATUS, "500")]),
            body: None,
            details: SCRIPT_ERROR_DETAILS,
        });
        true
    }

    fn invalidate_wrappers(&mut self) {
        for pair in [self.request.as_mut(), self.response.as_mut()].into_iter().flatten() {
            pair.handle.invalidate_wrappers();
        }
    }
}
