//! Filter status codes and the callback surface the proxy offers to a stream filter

use crate::headers::HeaderMap;
use crate::stream_info::{Connection, RouteEntry, StreamInfo};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Result of a filter's header callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Continue to the next filter
    Continue,
    /// Stop iteration until the filter asks to continue
    StopIteration,
    /// The filter already sent a local reply; the stream ends here
    LocalReplySent,
}

/// Result of a filter's data callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    /// Pass the chunk on
    Continue,
    /// Hold iteration and keep buffering data in the proxy
    StopIterationAndBuffer,
    /// Hold iteration without buffering
    StopIterationNoBuffer,
}

/// Result of a filter's trailer callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    /// Continue to the next filter
    Continue,
    /// Stop iteration until the filter asks to continue
    StopIteration,
}

/// Locally generated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
    /// Response status
    pub status: StatusCode,
    /// Extra response headers (including `:status`)
    pub headers: HeaderMap,
    /// Response body
    pub body: Option<Bytes>,
    /// Details string recorded in stream info
    pub details: &'static str,
}

/// Callbacks shared by both directions of a stream
pub trait StreamFilterCallbacks: fmt::Debug {
    /// Stream info for the current stream
    fn stream_info(&self) -> &StreamInfo;

    /// Mutable stream info, used to write dynamic metadata
    fn stream_info_mut(&mut self) -> &mut StreamInfo;

    /// Downstream connection, if the stream has one
    fn connection(&self) -> Option<&Connection>;

    /// Span of the active request
    fn active_span(&self) -> tracing::Span;

    /// Name the filter was configured under
    fn filter_config_name(&self) -> &str;

    /// Most specific per-route filter config for the stream
    fn most_specific_per_filter_config(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Matched route
    fn route(&self) -> Option<Arc<RouteEntry>> {
        self.stream_info().route.clone()
    }
}

/// Callbacks for the request (decode) path
pub trait StreamDecoderFilterCallbacks: StreamFilterCallbacks {
    /// Append data to the decoding buffer
    fn add_decoded_data(&mut self, data: &[u8]);

    /// Snapshot of the currently buffered request body
    fn decoding_buffer(&self) -> Option<Bytes>;

    /// Mutate the buffered request body in place, creating it when missing
    fn modify_decoding_buffer(&mut self, modify: &mut dyn FnMut(&mut BytesMut));

    /// Resume request iteration after a stop
    fn continue_decoding(&mut self);

    /// Send a locally generated response and end the stream
    fn send_local_reply(&mut self, reply: LocalReply);

    /// Pin the upstream host for this request
    fn set_upstream_override_host(&mut self, host: &str, strict: bool);

    /// Drop the cached route so it is recomputed; a no-op when routing is not available
    fn clear_route_cache(&mut self);
}

/// Callbacks for the response (encode) path
pub trait StreamEncoderFilterCallbacks: StreamFilterCallbacks {
    /// Append data to the encoding buffer
    fn add_encoded_data(&mut self, data: &[u8]);

    /// Snapshot of the currently buffered response body
    fn encoding_buffer(&self) -> Option<Bytes>;

    /// Mutate the buffered response body in place, creating it when missing
    fn modify_encoding_buffer(&mut self, modify: &mut dyn FnMut(&mut BytesMut));

    /// Resume response iteration after a stop
    fn continue_encoding(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_reply_equality() {
        let reply = LocalReply {
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::from_pairs([(":status", "403")]),
            body: Some(Bytes::from_static(b"denied")),
            details: "script_response",
        };
        assert_eq!(reply.clone(), reply);
        assert_eq!(reply.headers.status(), Some(403));
    }
}
