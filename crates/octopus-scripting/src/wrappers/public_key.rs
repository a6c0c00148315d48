//! Imported public key wrapper

use super::{Method, Reply, WrapperContext};
use crate::error::Result;
use crate::value::{Args, Value};
use bytes::Bytes;

/// Reference to a key in the handle's key storage
///
/// `get()` returns the key bytes, which `verifySignature` uses to find the parsed key; it
/// returns nil when the bytes did not parse as a public key.
#[derive(Debug)]
pub(crate) struct PublicKeyWrapper {
    key: Option<Bytes>,
}

impl PublicKeyWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[("get", Self::get)];

    pub(crate) fn new(key: Option<Bytes>) -> Self {
        Self { key }
    }

    fn get(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.key.clone().map(Value::String)))
    }
}
