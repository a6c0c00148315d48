//! Header and trailer map wrapper

use super::{Method, Reply, WrapperContext};
use crate::error::{Result, ScriptError};
use crate::value::{Args, Value};
use octopus_core::SharedHeaderMap;

/// Which map a wrapper exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderKind {
    /// Request/response headers; frozen once continued
    Headers,
    /// Trailers; always modifiable
    Trailers,
}

#[derive(Debug)]
pub(crate) struct HeaderMapWrapper {
    map: SharedHeaderMap,
    kind: HeaderKind,
}

impl HeaderMapWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[
        ("get", Self::get),
        ("getAtIndex", Self::get_at_index),
        ("getNumValues", Self::get_num_values),
        ("add", Self::add),
        ("replace", Self::replace),
        ("remove", Self::remove),
        ("pairs", Self::pairs),
    ];

    pub(crate) fn new(map: SharedHeaderMap, kind: HeaderKind) -> Self {
        Self { map, kind }
    }

    fn check_modifiable(&self, ctx: &mut WrapperContext<'_>) -> Result<()> {
        match self.kind {
            HeaderKind::Trailers => Ok(()),
            HeaderKind::Headers if ctx.headers_continued => {
                Err(ScriptError::runtime("header map can no longer be modified"))
            }
            HeaderKind::Headers => {
                ctx.callbacks.on_headers_modified();
                Ok(())
            }
        }
    }

    fn get(&mut self, _ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        Ok(Reply::value(self.map.borrow().get_joined(key)))
    }

    fn get_at_index(&mut self, _ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        let index = args.check_integer(1)?;
        let map = self.map.borrow();
        let value = usize::try_from(index)
            .ok()
            .and_then(|i| map.get_all(key).get(i).map(|v| v.to_string()));
        Ok(Reply::value(value))
    }

    fn get_num_values(&mut self, _ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        let count = self.map.borrow().get_all(key).len();
        Ok(Reply::value(count as i64))
    }

    fn add(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        let value = args.check_str(1)?;
        self.check_modifiable(ctx)?;
        self.map.borrow_mut().add(key, value);
        Ok(Reply::none())
    }

    fn replace(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        let value = args.check_str(1)?;
        self.check_modifiable(ctx)?;
        self.map.borrow_mut().set(key, value);
        Ok(Reply::none())
    }

    fn remove(&mut self, ctx: &mut WrapperContext<'_>, args: &Args) -> Result<Reply> {
        let key = args.check_str(0)?;
        self.check_modifiable(ctx)?;
        self.map.borrow_mut().remove(key);
        Ok(Reply::none())
    }

    fn pairs(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let pairs = self
            .map
            .borrow()
            .iter()
            .map(|(k, v)| Value::Array(vec![k.into(), v.into()]))
            .collect::<Vec<_>>();
        Ok(Reply::value(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCallbacks;
    use octopus_core::HeaderMap;

    fn call(
        wrapper: &mut HeaderMapWrapper,
        callbacks: &mut RecordingCallbacks,
        continued: bool,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mut chunk = None;
        let mut ctx = WrapperContext {
            callbacks,
            headers_continued: continued,
            current_chunk: &mut chunk,
        };
        let f = super::super::lookup(HeaderMapWrapper::METHODS, method).unwrap();
        match f(wrapper, &mut ctx, &Args::new(args))? {
            Reply::Values(values) => Ok(values),
            Reply::Object(_) => panic!("unexpected object"),
        }
    }

    #[test]
    fn test_reads() {
        let map = HeaderMap::from_pairs([("x-a", "1"), ("x-a", "2"), ("x-b", "3")]).into_shared();
        let mut wrapper = HeaderMapWrapper::new(map, HeaderKind::Headers);
        let mut cb = RecordingCallbacks::default();

        let v = call(&mut wrapper, &mut cb, false, "get", vec!["x-a".into()]).unwrap();
        assert_eq!(v[0].as_str(), Some("1,2"));

        let v = call(&mut wrapper, &mut cb, false, "getAtIndex", vec!["x-a".into(), 1.into()]).unwrap();
        assert_eq!(v[0].as_str(), Some("2"));

        let v = call(&mut wrapper, &mut cb, false, "getAtIndex", vec!["x-a".into(), 5.into()]).unwrap();
        assert!(v[0].is_nil());

        let v = call(&mut wrapper, &mut cb, false, "getNumValues", vec!["x-a".into()]).unwrap();
        assert_eq!(v[0], Value::Integer(2));

        let v = call(&mut wrapper, &mut cb, false, "pairs", vec![]).unwrap();
        assert_eq!(v[0].as_array().unwrap().len(), 3);
        assert_eq!(cb.headers_modified, 0);
    }

    #[test]
    fn test_mutation_notifies_until_continued() {
        let map = HeaderMap::new().into_shared();
        let mut wrapper = HeaderMapWrapper::new(map.clone(), HeaderKind::Headers);
        let mut cb = RecordingCallbacks::default();

        call(&mut wrapper, &mut cb, false, "add", vec!["x-a".into(), "1".into()]).unwrap();
        call(&mut wrapper, &mut cb, false, "replace", vec!["x-a".into(), "2".into()]).unwrap();
        assert_eq!(map.borrow().get("x-a"), Some("2"));
        assert_eq!(cb.headers_modified, 2);

        let err = call(&mut wrapper, &mut cb, true, "remove", vec!["x-a".into()]).unwrap_err();
        assert_eq!(err.message(), "header map can no longer be modified");
        assert_eq!(map.borrow().get("x-a"), Some("2"));
    }

    #[test]
    fn test_trailers_stay_modifiable() {
        let map = HeaderMap::new().into_shared();
        let mut wrapper = HeaderMapWrapper::new(map.clone(), HeaderKind::Trailers);
        let mut cb = RecordingCallbacks::default();

        call(&mut wrapper, &mut cb, true, "add", vec!["grpc-status".into(), "0".into()]).unwrap();
        assert_eq!(map.borrow().get("grpc-status"), Some("0"));
        assert_eq!(cb.headers_modified, 0);
    }
}
