//! Stream info wrappers

use super::{
    ConnectionDynamicMetadataWrapper, DynamicMetadataWrapper, Method, Reply, SslConnectionWrapper,
    Wrapper, WrapperContext,
};
use crate::error::Result;
use crate::value::Args;
use std::net::SocketAddr;

fn address(address: Option<SocketAddr>) -> Reply {
    Reply::value(address.map(|a| a.to_string()))
}

/// Per-stream info; reads through to the proxy on every call
#[derive(Debug)]
pub(crate) struct StreamInfoWrapper;

impl StreamInfoWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[
        ("protocol", Self::protocol),
        ("routeName", Self::route_name),
        ("requestedServerName", Self::requested_server_name),
        ("downstreamLocalAddress", Self::downstream_local_address),
        ("downstreamRemoteAddress", Self::downstream_remote_address),
        (
            "downstreamDirectRemoteAddress",
            Self::downstream_direct_remote_address,
        ),
        ("dynamicMetadata", Self::dynamic_metadata),
        ("downstreamSslConnection", Self::downstream_ssl_connection),
    ];

    fn protocol(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let protocol = ctx.callbacks.stream_info().protocol;
        Ok(Reply::value(protocol.map(|p| p.to_string())))
    }

    fn route_name(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(ctx.callbacks.stream_info().route_name()))
    }

    fn requested_server_name(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let sni = ctx.callbacks.stream_info().requested_server_name.as_deref();
        Ok(Reply::value(sni.unwrap_or("")))
    }

    fn downstream_local_address(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(address(ctx.callbacks.stream_info().downstream_local_address))
    }

    fn downstream_remote_address(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(address(ctx.callbacks.stream_info().downstream_remote_address))
    }

    fn downstream_direct_remote_address(
        &mut self,
        ctx: &mut WrapperContext<'_>,
        _args: &Args,
    ) -> Result<Reply> {
        Ok(address(
            ctx.callbacks.stream_info().downstream_direct_remote_address,
        ))
    }

    fn dynamic_metadata(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::Object(Wrapper::DynamicMetadata(DynamicMetadataWrapper)))
    }

    fn downstream_ssl_connection(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let ssl = ctx.callbacks.stream_info().downstream_ssl.clone();
        Ok(Reply::object_or_nil(
            ssl.map(|info| Wrapper::SslConnection(SslConnectionWrapper::new(info))),
        ))
    }
}

/// Stream info of the downstream connection
#[derive(Debug)]
pub(crate) struct ConnectionStreamInfoWrapper;

impl ConnectionStreamInfoWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] =
        &[("dynamicMetadata", Self::dynamic_metadata)];

    fn dynamic_metadata(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::Object(Wrapper::ConnectionDynamicMetadata(
            ConnectionDynamicMetadataWrapper,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCallbacks;
    use crate::value::Value;
    use octopus_core::{Protocol, RouteEntry, SslConnectionInfo};
    use std::sync::Arc;

    fn call(wrapper: &mut StreamInfoWrapper, cb: &mut RecordingCallbacks, method: &str) -> Reply {
        let mut chunk = None;
        let mut ctx = WrapperContext {
            callbacks: cb,
            headers_continued: false,
            current_chunk: &mut chunk,
        };
        let f = super::super::lookup(StreamInfoWrapper::METHODS, method).unwrap();
        f(wrapper, &mut ctx, &Args::default()).unwrap()
    }

    fn first(reply: Reply) -> Value {
        match reply {
            Reply::Values(values) => values.into_iter().next().unwrap_or_default(),
            Reply::Object(_) => panic!("unexpected object"),
        }
    }

    #[test]
    fn test_plain_fields() {
        let mut cb = RecordingCallbacks::default();
        cb.stream_info.protocol = Some(Protocol::Http2);
        cb.stream_info.downstream_remote_address = Some("10.0.0.1:443".parse().unwrap());
        cb.stream_info.route = Some(Arc::new(RouteEntry {
            name: "api".to_string(),
            ..Default::default()
        }));
        let mut wrapper = StreamInfoWrapper;

        assert_eq!(first(call(&mut wrapper, &mut cb, "protocol")).as_str(), Some("HTTP/2"));
        assert_eq!(first(call(&mut wrapper, &mut cb, "routeName")).as_str(), Some("api"));
        assert_eq!(
            first(call(&mut wrapper, &mut cb, "downstreamRemoteAddress")).as_str(),
            Some("10.0.0.1:443")
        );
        assert!(first(call(&mut wrapper, &mut cb, "downstreamLocalAddress")).is_nil());
        assert_eq!(first(call(&mut wrapper, &mut cb, "requestedServerName")).as_str(), Some(""));
    }

    #[test]
    fn test_child_wrappers() {
        let mut cb = RecordingCallbacks::default();
        let mut wrapper = StreamInfoWrapper;

        assert!(first(call(&mut wrapper, &mut cb, "downstreamSslConnection")).is_nil());
        assert!(matches!(
            call(&mut wrapper, &mut cb, "dynamicMetadata"),
            Reply::Object(Wrapper::DynamicMetadata(_))
        ));

        cb.stream_info.downstream_ssl = Some(SslConnectionInfo::default());
        assert!(matches!(
            call(&mut wrapper, &mut cb, "downstreamSslConnection"),
            Reply::Object(Wrapper::SslConnection(_))
        ));
    }
}
