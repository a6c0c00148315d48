//! Accessor objects handed to scripts
//!
//! Wrappers live in a [`WrapperArena`] owned by the stream handle. Scripts only ever see an
//! [`ObjectRef`] (kind, slot, epoch). Invalidating the arena bumps the epoch, so any reference
//! kept across a yield fails with "object used outside of proper scope" instead of touching
//! stale proxy state.
//!
//! Each wrapper type exposes a static `(name, fn)` method table.

mod buffer;
mod connection;
mod headers;
mod metadata;
mod public_key;
mod stream_info;

pub(crate) use buffer::{BufferSource, BufferWrapper};
pub(crate) use connection::{ConnectionWrapper, SslConnectionWrapper};
pub(crate) use headers::{HeaderKind, HeaderMapWrapper};
pub(crate) use metadata::{
    ConnectionDynamicMetadataWrapper, DynamicMetadataWrapper, MetadataMapWrapper,
    VirtualHostWrapper,
};
pub(crate) use public_key::PublicKeyWrapper;
pub(crate) use stream_info::{ConnectionStreamInfoWrapper, StreamInfoWrapper};

use crate::callbacks::FilterCallbacks;
use crate::error::{Result, ScriptError};
use crate::value::{Args, Value};
use bytes::BytesMut;
use std::collections::HashMap;
use tracing::trace;

/// Kind of host object behind an [`ObjectRef`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Header or trailer map
    HeaderMap,
    /// Body or body chunk
    Buffer,
    /// Read-only metadata map
    Metadata,
    /// Stream info
    StreamInfo,
    /// Stream dynamic metadata
    DynamicMetadata,
    /// Connection dynamic metadata (read only)
    ConnectionDynamicMetadata,
    /// Downstream connection
    Connection,
    /// TLS details of the downstream connection
    SslConnection,
    /// Connection-level stream info
    ConnectionStreamInfo,
    /// Imported public key
    PublicKey,
    /// Virtual host
    VirtualHost,
    /// Body chunk iterator
    BodyChunks,
}

/// Script-visible reference to a host object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    kind: ObjectKind,
    slot: u32,
    epoch: u64,
}

impl ObjectRef {
    /// Kind of the referenced object
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The body chunk iterator is not arena-allocated and stays valid for the stream
    pub(crate) fn body_chunks() -> Self {
        Self {
            kind: ObjectKind::BodyChunks,
            slot: 0,
            epoch: 0,
        }
    }
}

/// Lazily built wrappers shared within one slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CacheKey {
    Headers,
    Body,
    Trailers,
    Metadata,
    StreamInfo,
    Connection,
    ConnectionStreamInfo,
    VirtualHost,
}

/// State a wrapper method may touch besides the wrapper itself
pub(crate) struct WrapperContext<'a> {
    pub(crate) callbacks: &'a mut dyn FilterCallbacks,
    pub(crate) headers_continued: bool,
    pub(crate) current_chunk: &'a mut Option<BytesMut>,
}

/// Result of a wrapper method
#[derive(Debug)]
pub(crate) enum Reply {
    Values(Vec<Value>),
    /// A child wrapper; the arena stores it and the script receives its reference
    Object(Wrapper),
}

impl Reply {
    pub(crate) fn value(value: impl Into<Value>) -> Self {
        Self::Values(vec![value.into()])
    }

    pub(crate) fn none() -> Self {
        Self::Values(Vec::new())
    }

    pub(crate) fn object_or_nil(wrapper: Option<Wrapper>) -> Self {
        match wrapper {
            Some(wrapper) => Self::Object(wrapper),
            None => Self::value(Value::Nil),
        }
    }
}

pub(crate) type Method<W> = fn(&mut W, &mut WrapperContext<'_>, &Args) -> Result<Reply>;

pub(crate) fn lookup<T: Copy>(table: &[(&'static str, T)], name: &str) -> Option<T> {
    table.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

fn invoke<W>(
    table: &[(&'static str, Method<W>)],
    type_name: &str,
    wrapper: &mut W,
    method: &str,
    ctx: &mut WrapperContext<'_>,
    args: &Args,
) -> Result<Reply> {
    let f = lookup(table, method).ok_or_else(|| {
        ScriptError::runtime(format!(
            "attempt to call unknown method '{}' on {}",
            method, type_name
        ))
    })?;
    f(wrapper, ctx, args)
}

/// A live accessor object
#[derive(Debug)]
pub(crate) enum Wrapper {
    HeaderMap(HeaderMapWrapper),
    Buffer(BufferWrapper),
    Metadata(MetadataMapWrapper),
    StreamInfo(StreamInfoWrapper),
    DynamicMetadata(DynamicMetadataWrapper),
    ConnectionDynamicMetadata(ConnectionDynamicMetadataWrapper),
    Connection(ConnectionWrapper),
    SslConnection(SslConnectionWrapper),
    ConnectionStreamInfo(ConnectionStreamInfoWrapper),
    PublicKey(PublicKeyWrapper),
    VirtualHost(VirtualHostWrapper),
}

impl Wrapper {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::HeaderMap(_) => ObjectKind::HeaderMap,
            Self::Buffer(_) => ObjectKind::Buffer,
            Self::Metadata(_) => ObjectKind::Metadata,
            Self::StreamInfo(_) => ObjectKind::StreamInfo,
            Self::DynamicMetadata(_) => ObjectKind::DynamicMetadata,
            Self::ConnectionDynamicMetadata(_) => ObjectKind::ConnectionDynamicMetadata,
            Self::Connection(_) => ObjectKind::Connection,
            Self::SslConnection(_) => ObjectKind::SslConnection,
            Self::ConnectionStreamInfo(_) => ObjectKind::ConnectionStreamInfo,
            Self::PublicKey(_) => ObjectKind::PublicKey,
            Self::VirtualHost(_) => ObjectKind::VirtualHost,
        }
    }

    pub(crate) fn call(
        &mut self,
        method: &str,
        ctx: &mut WrapperContext<'_>,
        args: &Args,
    ) -> Result<Reply> {
        match self {
            Self::HeaderMap(w) => invoke(HeaderMapWrapper::METHODS, "header map", w, method, ctx, args),
            Self::Buffer(w) => invoke(BufferWrapper::METHODS, "buffer", w, method, ctx, args),
            Self::Metadata(w) => invoke(MetadataMapWrapper::METHODS, "metadata", w, method, ctx, args),
            Self::StreamInfo(w) => {
                invoke(StreamInfoWrapper::METHODS, "stream info", w, method, ctx, args)
            }
            Self::DynamicMetadata(w) => invoke(
                DynamicMetadataWrapper::METHODS,
                "dynamic metadata",
                w,
                method,
                ctx,
                args,
            ),
            Self::ConnectionDynamicMetadata(w) => invoke(
                ConnectionDynamicMetadataWrapper::METHODS,
                "connection dynamic metadata",
                w,
                method,
                ctx,
                args,
            ),
            Self::Connection(w) => invoke(ConnectionWrapper::METHODS, "connection", w, method, ctx, args),
            Self::SslConnection(w) => invoke(
                SslConnectionWrapper::METHODS,
                "ssl connection",
                w,
                method,
                ctx,
                args,
            ),
            Self::ConnectionStreamInfo(w) => invoke(
                ConnectionStreamInfoWrapper::METHODS,
                "connection stream info",
                w,
                method,
                ctx,
                args,
            ),
            Self::PublicKey(w) => invoke(PublicKeyWrapper::METHODS, "public key", w, method, ctx, args),
            Self::VirtualHost(w) => {
                invoke(VirtualHostWrapper::METHODS, "virtual host", w, method, ctx, args)
            }
        }
    }
}

/// Owner of every wrapper created during the current slice
#[derive(Debug, Default)]
pub(crate) struct WrapperArena {
    epoch: u64,
    slots: Vec<Wrapper>,
    cache: HashMap<CacheKey, ObjectRef>,
}

impl WrapperArena {
    pub(crate) fn insert(&mut self, wrapper: Wrapper) -> ObjectRef {
        let object = ObjectRef {
            kind: wrapper.kind(),
            slot: self.slots.len() as u32,
            epoch: self.epoch,
        };
        self.slots.push(wrapper);
        object
    }

    /// Cached wrapper for `key`, built on first use within the slice
    pub(crate) fn cached(&mut self, key: CacheKey, build: impl FnOnce() -> Wrapper) -> ObjectRef {
        if let Some(object) = self.cache.get(&key) {
            return *object;
        }
        let object = self.insert(build());
        self.cache.insert(key, object);
        object
    }

    pub(crate) fn get_mut(&mut self, object: ObjectRef) -> Result<&mut Wrapper> {
        if object.epoch != self.epoch {
            return Err(ScriptError::out_of_scope());
        }
        self.slots
            .get_mut(object.slot as usize)
            .ok_or_else(ScriptError::out_of_scope)
    }

    /// Drop every wrapper; references handed out so far become stale
    pub(crate) fn invalidate(&mut self) {
        if !self.slots.is_empty() {
            trace!(count = self.slots.len(), "invalidating wrappers");
        }
        self.slots.clear();
        self.cache.clear();
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub(crate) fn live_wrappers(&self) -> usize {
        self.slots.len()
    }
}
