//! Coroutine over a script future

use crate::error::{Result, ScriptError};
use crate::runtime::{Coroutine, CoroutineStatus, CoroutineStep, HostCall, HostReply};
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::trace;

/// Exchange point between a script future and its coroutine
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    outgoing: Option<HostCall>,
    reply: Option<HostReply>,
}

pub(crate) type SharedMailbox = Rc<RefCell<Mailbox>>;

/// Future of a single host call
///
/// The first poll posts the call and parks; the next poll after the coroutine delivered a
/// reply completes with it.
#[derive(Debug)]
pub struct HostCallFuture {
    call: Option<HostCall>,
    mailbox: SharedMailbox,
}

impl HostCallFuture {
    pub(crate) fn new(call: HostCall, mailbox: SharedMailbox) -> Self {
        Self {
            call: Some(call),
            mailbox,
        }
    }
}

impl Future for HostCallFuture {
    type Output = HostReply;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(call) = self.call.take() {
            self.mailbox.borrow_mut().outgoing = Some(call);
            return Poll::Pending;
        }
        match self.mailbox.borrow_mut().reply.take() {
            Some(reply) => Poll::Ready(reply),
            None => Poll::Pending,
        }
    }
}

/// [`Coroutine`] driving a script future with a no-op waker
pub(crate) struct NativeCoroutine {
    name: String,
    future: LocalBoxFuture<'static, Result<()>>,
    mailbox: SharedMailbox,
    status: CoroutineStatus,
}

impl NativeCoroutine {
    pub(crate) fn new(
        name: String,
        future: LocalBoxFuture<'static, Result<()>>,
        mailbox: SharedMailbox,
    ) -> Self {
        Self {
            name,
            future,
            mailbox,
            status: CoroutineStatus::Suspended,
        }
    }
}

impl fmt::Debug for NativeCoroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCoroutine")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish()
    }
}

impl Coroutine for NativeCoroutine {
    fn status(&self) -> CoroutineStatus {
        self.status
    }

    fn resume(&mut self, reply: Option<HostReply>) -> Result<CoroutineStep> {
        if self.status == CoroutineStatus::Dead {
            return Err(ScriptError::runtime("cannot resume dead coroutine"));
        }
        if let Some(reply) = reply {
            self.mailbox.borrow_mut().reply = Some(reply);
        }
        self.status = CoroutineStatus::Running;

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match self.future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(())) => {
                trace!(script = %self.name, "coroutine finished");
                self.status = CoroutineStatus::Dead;
                Ok(CoroutineStep::Finished)
            }
            Poll::Ready(Err(e)) => {
                self.status = CoroutineStatus::Dead;
                Err(e)
            }
            Poll::Pending => match self.mailbox.borrow_mut().outgoing.take() {
                Some(call) => Ok(CoroutineStep::HostCall(call)),
                None => {
                    self.status = CoroutineStatus::Dead;
                    Err(ScriptError::runtime(
                        "script awaited something other than a host call",
                    ))
                }
            },
        }
    }

    fn suspend(&mut self) {
        if self.status == CoroutineStatus::Running {
            self.status = CoroutineStatus::Suspended;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn coroutine<F>(future: F) -> (NativeCoroutine, SharedMailbox)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        let mailbox = SharedMailbox::default();
        let co = NativeCoroutine::new("test".to_string(), Box::pin(future), mailbox.clone());
        (co, mailbox)
    }

    #[test]
    fn test_host_call_round_trip() {
        let mailbox = SharedMailbox::default();
        let inner = mailbox.clone();
        let mut co = NativeCoroutine::new(
            "test".to_string(),
            Box::pin(async move {
                let reply = HostCallFuture::new(HostCall::handle("headers", vec![]), inner).await?;
                assert_eq!(reply, vec![Value::Integer(7)]);
                Ok(())
            }),
            mailbox,
        );

        assert_eq!(co.status(), CoroutineStatus::Suspended);
        let step = co.resume(None).unwrap();
        assert_eq!(step, CoroutineStep::HostCall(HostCall::handle("headers", vec![])));
        assert_eq!(co.status(), CoroutineStatus::Running);

        co.suspend();
        assert_eq!(co.status(), CoroutineStatus::Suspended);

        let step = co.resume(Some(Ok(vec![Value::Integer(7)]))).unwrap();
        assert_eq!(step, CoroutineStep::Finished);
        assert_eq!(co.status(), CoroutineStatus::Dead);
        assert!(co.resume(None).is_err());
    }

    #[test]
    fn test_script_error_kills_coroutine() {
        let (mut co, _) = coroutine(async { Err(ScriptError::runtime("boom")) });
        let err = co.resume(None).unwrap_err();
        assert_eq!(err.message(), "boom");
        assert_eq!(co.status(), CoroutineStatus::Dead);
    }

    #[test]
    fn test_foreign_await_is_an_error() {
        let (mut co, _) = coroutine(async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        assert!(co.resume(None).is_err());
        assert_eq!(co.status(), CoroutineStatus::Dead);
    }
}
