//! Metadata wrappers

use super::{Method, Reply, Wrapper, WrapperContext};
use crate::error::{Result, ScriptError};
use crate::value::{Args, Value};
use octopus_core::{Metadata, Struct};

fn struct_pairs(map: &Struct) -> Value {
    Value::Array(
        map.iter()
            .map(|(k, v)| Value::Array(vec![k.as_str().into(), v.into()]))
            .collect(),
    )
}

fn metadata_pairs(metadata: &Metadata) -> Value {
    Value::Array(
        metadata
            .filter_metadata
            .iter()
            .map(|(k, v)| Value::Array(vec![k.as_str().into(), v.into()]))
            .collect(),
    )
}

/// Read-only view of one metadata struct
#[derive(Debug)]
pub(crate) struct MetadataMapWrapper {
    map: Struct,
}

impl MetadataMapWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] =
        &[("get", Self::get), ("pairs", Self::pairs)];

    pub(crate) fn new(map: Struct) -> Self {
        Self { map }
    }

    fn get(&mut self, _ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        Ok(Reply::value(self.map.get(key).map(Value::from)))
    }

    fn pairs(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(struct_pairs(&self.map)))
    }
}

/// Dynamic metadata of the stream, readable and writable
#[derive(Debug)]
pub(crate) struct DynamicMetadataWrapper;

impl DynamicMetadataWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[
        ("get", Self::get),
        ("set", Self::set),
        ("pairs", Self::pairs),
    ];

    fn get(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let filter = args.check_str(0)?;
        let metadata = &ctx.callbacks.stream_info().dynamic_metadata;
        Ok(Reply::value(metadata.get(filter).map(Value::from)))
    }

    fn set(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let filter = args.check_str(0)?;
        let key = args.check_str(1)?;
        let value = args.get(2);
        if matches!(value, Value::Object(_)) {
            return Err(ScriptError::type_error(
                "dynamic metadata values must be plain data",
            ));
        }
        ctx.callbacks
            .stream_info_mut()
            .dynamic_metadata
            .entry(filter)
            .insert(key.to_string(), value.to_json());
        Ok(Reply::none())
    }

    fn pairs(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(metadata_pairs(
            &ctx.callbacks.stream_info().dynamic_metadata,
        )))
    }
}

/// Dynamic metadata of the downstream connection; read only
#[derive(Debug)]
pub(crate) struct ConnectionDynamicMetadataWrapper;

impl ConnectionDynamicMetadataWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] =
        &[("get", Self::get), ("pairs", Self::pairs)];

    fn get(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let filter = args.check_str(0)?;
        let value = ctx
            .callbacks
            .connection()
            .and_then(|c| c.stream_info.dynamic_metadata.get(filter))
            .map(Value::from);
        Ok(Reply::value(value))
    }

    fn pairs(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let pairs = ctx
            .callbacks
            .connection()
            .map(|c| metadata_pairs(&c.stream_info.dynamic_metadata))
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(Reply::value(pairs))
    }
}

/// The matched virtual host
#[derive(Debug)]
pub(crate) struct VirtualHostWrapper {
    metadata: Struct,
}

impl VirtualHostWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] =
        &[("metadata", Self::metadata)];

    pub(crate) fn new(metadata: Struct) -> Self {
        Self { metadata }
    }

    fn metadata(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::Object(Wrapper::Metadata(MetadataMapWrapper::new(
            self.metadata.clone(),
        ))))
    }
}
