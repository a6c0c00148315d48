//! Body and body-chunk wrapper

use super::{Method, Reply, WrapperContext};
use crate::error::{Result, ScriptError};
use crate::value::Args;
use bytes::{Bytes, BytesMut};
use octopus_core::SharedHeaderMap;

/// Data a buffer wrapper reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferSource {
    /// The body buffered by the proxy
    Body,
    /// The chunk currently being delivered to the script
    Chunk,
}

#[derive(Debug)]
pub(crate) struct BufferWrapper {
    source: BufferSource,
    headers: SharedHeaderMap,
}

impl BufferWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[
        ("length", Self::length),
        ("getBytes", Self::get_bytes),
        ("setBytes", Self::set_bytes),
    ];

    pub(crate) fn new(source: BufferSource, headers: SharedHeaderMap) -> Self {
        Self { source, headers }
    }

    fn contents(&self, ctx: &WrapperContext<'_>) -> Result<Bytes> {
        match self.source {
            BufferSource::Body => Ok(ctx.callbacks.buffered_body().unwrap_or_default()),
            BufferSource::Chunk => ctx
                .current_chunk
                .as_ref()
                .map(|chunk| Bytes::copy_from_slice(chunk))
                .ok_or_else(ScriptError::out_of_scope),
        }
    }

    fn length(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let length = match self.source {
            BufferSource::Body => ctx.callbacks.buffered_body().map_or(0, |b| b.len()),
            BufferSource::Chunk => ctx
                .current_chunk
                .as_ref()
                .map(|chunk| chunk.len())
                .ok_or_else(ScriptError::out_of_scope)?,
        };
        Ok(Reply::value(length as i64))
    }

    fn get_bytes(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let index = args.check_integer(0)?;
        let length = args.check_integer(1)?;
        let data = self.contents(ctx)?;

        let range = usize::try_from(index)
            .ok()
            .zip(usize::try_from(length).ok())
            .and_then(|(index, length)| Some(index..index.checked_add(length)?))
            .filter(|range| range.end <= data.len())
            .ok_or_else(|| {
                ScriptError::runtime(
                    "index/length must be >= 0 and (index + length) must be <= buffer size",
                )
            })?;
        Ok(Reply::value(data.slice(range)))
    }

    fn set_bytes(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let data = args.check_bytes(0)?.clone();
        let mut replace = |buffer: &mut BytesMut| {
            buffer.clear();
            buffer.extend_from_slice(&data);
        };
        match self.source {
            BufferSource::Body => ctx.callbacks.modify_buffered_body(&mut replace),
            BufferSource::Chunk => {
                let chunk = ctx
                    .current_chunk
                    .as_mut()
                    .ok_or_else(ScriptError::out_of_scope)?;
                replace(chunk);
            }
        }
        self.headers.borrow_mut().set_content_length(data.len());
        Ok(Reply::none())
    }
}
