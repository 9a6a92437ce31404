//! axum WebSocket transport.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::manager::{ConnectionManager, Transport};
use crate::protocol::{ErrorCode, ServerMessage};

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;

/// Write half of an upgraded socket.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: &ServerMessage) -> GatewayResult<()> {
        let json = message.to_json()?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(GatewayError::transport)
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CLOSE_NORMAL,
            reason: "closed".into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

/// Complete a WebSocket upgrade and hand the socket to `manager`.
pub fn upgrade(ws: WebSocketUpgrade, manager: Arc<ConnectionManager>, client_key: String) -> Response {
    ws.on_upgrade(move |socket| serve_socket(manager, socket, client_key))
}

/// Drive one socket until either side closes it.
pub async fn serve_socket(manager: Arc<ConnectionManager>, socket: WebSocket, client_key: String) {
    let (sink, mut stream) = socket.split();
    let handle = match manager.register(client_key, WsTransport { sink }) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(error = %e, "refusing websocket connection");
            return;
        }
    };
    let id = handle.id();

    loop {
        let message = tokio::select! {
            biased;

            _ = handle.closed() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = manager.handle_text(id, text.as_str()) {
                    debug!(connection = %id, error = %e, "client message not applied");
                }
            }
            Some(Ok(Message::Binary(_))) => {
                manager.reject(id, ErrorCode::BadRequest, "binary frames are not supported");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                manager.disconnect(id);
                break;
            }
            Some(Err(e)) => {
                warn!(connection = %id, error = %e, "websocket read failed");
                manager.disconnect(id);
                break;
            }
        }
    }
}
