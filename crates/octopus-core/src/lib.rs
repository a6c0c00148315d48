//! # Octopus Core
//!
//! Proxy-side types and traits consumed by the Octopus script filter.
//!
//! This crate provides the vocabulary the filter chain speaks:
//! - Header maps (including pseudo-headers) and filter status codes
//! - Decoder/encoder callback traits implemented by the proxy
//! - Stream info, metadata and connection descriptions
//! - The upstream async-call subsystem
//! - Error types

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod filter;
pub mod headers;
pub mod stream_info;
pub mod time;
pub mod upstream;

pub use error::{Error, Result};
pub use filter::{
    FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, LocalReply,
    StreamDecoderFilterCallbacks, StreamEncoderFilterCallbacks, StreamFilterCallbacks,
};
pub use headers::{HeaderMap, SharedHeaderMap};
pub use stream_info::{
    Connection, Metadata, Protocol, RouteEntry, SslConnectionInfo, StreamInfo, Struct,
    VirtualHost,
};
pub use time::{SystemTimeSource, TimeSource};
pub use upstream::{
    AsyncRequest, CallCompletion, CallDispatch, CallId, ClusterManager, FailureReason,
    HttpCallRequest, HttpCallResponse, HyperClusterManager, RequestOptions,
};

pub use bytes::{Bytes, BytesMut};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::filter::*;
    pub use crate::headers::{HeaderMap, SharedHeaderMap};
    pub use crate::stream_info::*;
    pub use crate::time::{SystemTimeSource, TimeSource};
    pub use crate::upstream::*;
}
