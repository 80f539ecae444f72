use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{RealtimeError, RealtimeResult, WebSocketBufferConfig, WsFrame};

pub mod tungstenite;

pub use tungstenite::TungsteniteTransport;

/// Boxed connect future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = RealtimeResult<(R, W)>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The session actor owns state and policies; the transport only opens sockets and moves
/// frames, so a scripted in-memory transport can stand in for a real one under test.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = RealtimeResult<WsFrame>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
