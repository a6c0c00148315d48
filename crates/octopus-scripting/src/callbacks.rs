//! Direction-agnostic view of the proxy callbacks
//!
//! The stream handle only ever talks to [`FilterCallbacks`]. [`DecoderCallbacks`] and
//! [`EncoderCallbacks`] adapt the request and response path APIs of the proxy to it.

use crate::error::{Result, ScriptError};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use octopus_core::{
    Connection, HeaderMap, LocalReply, Metadata, StreamDecoderFilterCallbacks,
    StreamEncoderFilterCallbacks, StreamFilterCallbacks, StreamInfo, Struct,
};
use std::fmt;
use tracing::debug;

/// Name metadata is looked up under when nothing is stored under the configured filter name
pub const CANONICAL_FILTER_NAME: &str = "octopus.filters.http.script";

/// Details recorded for local replies sent by a script
pub const SCRIPT_RESPONSE_DETAILS: &str = "script_response";

/// Operations the stream handle needs from the proxy, whatever the direction
pub trait FilterCallbacks: fmt::Debug {
    /// Append data to the proxy's buffer for this direction
    fn add_data(&mut self, data: &[u8]);

    /// Body buffered so far, if any
    fn buffered_body(&self) -> Option<Bytes>;

    /// Modify the buffered body in place
    fn modify_buffered_body(&mut self, modify: &mut dyn FnMut(&mut BytesMut));

    /// Resume iteration after the filter stopped it
    fn continue_iteration(&mut self);

    /// Headers were modified before being continued
    fn on_headers_modified(&mut self);

    /// Send a local reply
    fn respond(&mut self, headers: HeaderMap, body: Option<Bytes>) -> Result<()>;

    /// Route metadata for this filter; empty when there is none
    fn metadata(&self) -> Struct;

    /// Stream info
    fn stream_info(&self) -> &StreamInfo;

    /// Mutable stream info
    fn stream_info_mut(&mut self) -> &mut StreamInfo;

    /// Downstream connection
    fn connection(&self) -> Option<&Connection>;

    /// Span of the active request
    fn active_span(&self) -> tracing::Span;

    /// Pin the upstream host
    fn set_upstream_override_host(&mut self, host: &str, strict: bool);

    /// Drop the cached route
    fn clear_route_cache(&mut self);

    /// Per-route filter context
    fn filter_context(&self) -> &Struct;

    /// Name the filter was configured under
    fn filter_config_name(&self) -> &str;
}

/// Metadata stored for this filter, under its configured name or the canonical one
pub(crate) fn filter_metadata(metadata: &Metadata, config_name: &str) -> Struct {
    metadata
        .get(config_name)
        .or_else(|| metadata.get(CANONICAL_FILTER_NAME))
        .cloned()
        .unwrap_or_default()
}

fn route_metadata<C: StreamFilterCallbacks + ?Sized>(callbacks: &C) -> Struct {
    callbacks
        .route()
        .map(|route| filter_metadata(&route.metadata, callbacks.filter_config_name()))
        .unwrap_or_default()
}

/// Request path adapter
pub struct DecoderCallbacks<'a> {
    inner: &'a mut dyn StreamDecoderFilterCallbacks,
    clear_route_cache: bool,
    filter_context: &'a Struct,
}

impl<'a> DecoderCallbacks<'a> {
    /// Wrap the proxy's decoder callbacks
    ///
    /// With `clear_route_cache` set, header modifications made by the script clear the
    /// route cache so routing sees the new headers.
    pub fn new(
        inner: &'a mut dyn StreamDecoderFilterCallbacks,
        clear_route_cache: bool,
        filter_context: &'a Struct,
    ) -> Self {
        Self {
            inner,
            clear_route_cache,
            filter_context,
        }
    }
}

impl fmt::Debug for DecoderCallbacks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderCallbacks")
            .field("clear_route_cache", &self.clear_route_cache)
            .finish_non_exhaustive()
    }
}

impl FilterCallbacks for DecoderCallbacks<'_> {
    fn add_data(&mut self, data: &[u8]) {
        self.inner.add_decoded_data(data);
    }

    fn buffered_body(&self) -> Option<Bytes> {
        self.inner.decoding_buffer()
    }

    fn modify_buffered_body(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        self.inner.modify_decoding_buffer(modify);
    }

    fn continue_iteration(&mut self) {
        self.inner.continue_decoding();
    }

    fn on_headers_modified(&mut self) {
        if self.clear_route_cache {
            self.inner.clear_route_cache();
        }
    }

    fn respond(&mut self, headers: HeaderMap, body: Option<Bytes>) -> Result<()> {
        let status = headers
            .status()
            .and_then(|status| StatusCode::from_u16(status).ok())
            .ok_or_else(|| ScriptError::runtime(":status must be between 200-599"))?;
        debug!(status = status.as_u16(), "sending local reply");
        self.inner.send_local_reply(LocalReply {
            status,
            headers,
            body,
            details: SCRIPT_RESPONSE_DETAILS,
        });
        Ok(())
    }

    fn metadata(&self) -> Struct {
        route_metadata(&*self.inner)
    }

    fn stream_info(&self) -> &StreamInfo {
        self.inner.stream_info()
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo {
        self.inner.stream_info_mut()
    }

    fn connection(&self) -> Option<&Connection> {
        self.inner.connection()
    }

    fn active_span(&self) -> tracing::Span {
        self.inner.active_span()
    }

    fn set_upstream_override_host(&mut self, host: &str, strict: bool) {
        self.inner.set_upstream_override_host(host, strict);
    }

    fn clear_route_cache(&mut self) {
        self.inner.clear_route_cache();
    }

    fn filter_context(&self) -> &Struct {
        self.filter_context
    }

    fn filter_config_name(&self) -> &str {
        self.inner.filter_config_name()
    }
}

/// Response path adapter
///
/// Routing is already decided on this path, so route-cache and upstream-host operations are
/// no-ops and local replies are rejected.
pub struct EncoderCallbacks<'a> {
    inner: &'a mut dyn StreamEncoderFilterCallbacks,
    filter_context: &'a Struct,
}

impl<'a> EncoderCallbacks<'a> {
    /// Wrap the proxy's encoder callbacks
    pub fn new(inner: &'a mut dyn StreamEncoderFilterCallbacks, filter_context: &'a Struct) -> Self {
        Self {
            inner,
            filter_context,
        }
    }
}

impl fmt::Debug for EncoderCallbacks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderCallbacks").finish_non_exhaustive()
    }
}

impl FilterCallbacks for EncoderCallbacks<'_> {
    fn add_data(&mut self, data: &[u8]) {
        self.inner.add_encoded_data(data);
    }

    fn buffered_body(&self) -> Option<Bytes> {
        self.inner.encoding_buffer()
    }

    fn modify_buffered_body(&mut self, modify: &mut dyn FnMut(&mut BytesMut)) {
        self.inner.modify_encoding_buffer(modify);
    }

    fn continue_iteration(&mut self) {
        self.inner.continue_encoding();
    }

    fn on_headers_modified(&mut self) {}

    fn respond(&mut self, _headers: HeaderMap, _body: Option<Bytes>) -> Result<()> {
        Err(ScriptError::runtime(
            "respond not currently supported in the response path",
        ))
    }

    fn metadata(&self) -> Struct {
        route_metadata(&*self.inner)
    }

    fn stream_info(&self) -> &StreamInfo {
        self.inner.stream_info()
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo {
        self.inner.stream_info_mut()
    }

    fn connection(&self) -> Option<&Connection> {
        self.inner.connection()
    }

    fn active_span(&self) -> tracing::Span {
        self.inner.active_span()
    }

    fn set_upstream_override_host(&mut self, _host: &str, _strict: bool) {}

    fn clear_route_cache(&mut self) {}

    fn filter_context(&self) -> &Struct {
        self.filter_context
    }

    fn filter_config_name(&self) -> &str {
        self.inner.filter_config_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDecoderCallbacks, MockEncoderCallbacks};
    use octopus_core::RouteEntry;
    use serde_json::json;
    use std::sync::Arc;

    fn route_with(namespace: &str) -> Arc<RouteEntry> {
        let mut metadata = Metadata::default();
        metadata
            .entry(namespace)
            .insert("owner".to_string(), json!(namespace));
        Arc::new(RouteEntry {
            name: "r".to_string(),
            metadata,
            virtual_host: None,
        })
    }

    #[test]
    fn test_metadata_prefers_config_name() {
        let mut mock = MockDecoderCallbacks::new();
        mock.config_name = "my-script".to_string();
        mock.stream_info.route = Some(route_with("my-script"));
        let context = Struct::new();
        let callbacks = DecoderCallbacks::new(&mut mock, true, &context);
        assert_eq!(callbacks.metadata().get("owner"), Some(&json!("my-script")));
    }

    #[test]
    fn test_metadata_falls_back_to_canonical_name() {
        let mut mock = MockDecoderCallbacks::new();
        mock.config_name = "my-script".to_string();
        mock.stream_info.route = Some(route_with(CANONICAL_FILTER_NAME));
        let context = Struct::new();
        let callbacks = DecoderCallbacks::new(&mut mock, true, &context);
        assert_eq!(
            callbacks.metadata().get("owner"),
            Some(&json!(CANONICAL_FILTER_NAME))
        );

        let mut mock = MockDecoderCallbacks::new();
        let callbacks = DecoderCallbacks::new(&mut mock, true, &context);
        assert!(callbacks.metadata().is_empty());
    }

    #[test]
    fn test_header_modification_clears_route_cache_when_enabled() {
        let context = Struct::new();
        let mut mock = MockDecoderCallbacks::new();
        let recorder = mock.recorder();
        DecoderCallbacks::new(&mut mock, true, &context).on_headers_modified();
        DecoderCallbacks::new(&mut mock, false, &context).on_headers_modified();
        assert_eq!(recorder.borrow().route_cache_clears, 1);
    }

    #[test]
    fn test_decoder_respond_sends_local_reply() {
        let context = Struct::new();
        let mut mock = MockDecoderCallbacks::new();
        let recorder = mock.recorder();
        let mut callbacks = DecoderCallbacks::new(&mut mock, true, &context);
        callbacks
            .respond(
                HeaderMap::from_pairs([(":status", "403")]),
                Some(Bytes::from_static(b"denied")),
            )
            .unwrap();

        let recorder = recorder.borrow();
        assert_eq!(recorder.local_replies.len(), 1);
        assert_eq!(recorder.local_replies[0].status, StatusCode::FORBIDDEN);
        assert_eq!(recorder.local_replies[0].details, SCRIPT_RESPONSE_DETAILS);
    }

    #[test]
    fn test_encoder_rejects_respond_and_routing_calls() {
        let context = Struct::new();
        let mut mock = MockEncoderCallbacks::new();
        let recorder = mock.recorder();
        let mut callbacks = EncoderCallbacks::new(&mut mock, &context);

        let err = callbacks
            .respond(HeaderMap::from_pairs([(":status", "200")]), None)
            .unwrap_err();
        assert_eq!(
            err.message(),
            "respond not currently supported in the response path"
        );
        callbacks.set_upstream_override_host("10.0.0.1", true);
        callbacks.clear_route_cache();

        let recorder = recorder.borrow();
        assert!(recorder.override_host.is_none());
        assert_eq!(recorder.route_cache_clears, 0);
    }
}
