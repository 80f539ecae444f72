use std::ops::ControlFlow;

use futures_util::{Sink, SinkExt};
use kameo::prelude::{
    Actor, ActorRef, ActorStopReason, Context, Message as KameoMessage, PanicError, WeakActorRef,
};
use tracing::{debug, error};

use crate::core::{RealtimeError, RealtimeResult, WsFrame};

/// Writer actor that owns the transport sink and serializes writes.
///
/// A failed write surfaces as an actor stop; the session observes it through its link.
pub struct WsWriterActor<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    writer: W,
}

impl<W> WsWriterActor<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> Actor for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "WsWriterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        // Best effort: the peer may already be gone.
        let _ = self.writer.close().await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: PanicError,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            error!(error = ?err, "WsWriterActor stopped after a failed write");
            Ok(ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWrite,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(target: "realtime-writer", "sending websocket frame to wire");
        self.writer.send(msg.frame).await
    }
}

/// Several frames flushed once, used for subscription replay.
#[derive(Clone, Debug)]
pub struct WriterWriteBatch {
    pub frames: Vec<WsFrame>,
}

impl<W> KameoMessage<WriterWriteBatch> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWriteBatch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for frame in msg.frames {
            self.writer.feed(frame).await?;
        }
        self.writer.flush().await
    }
}
