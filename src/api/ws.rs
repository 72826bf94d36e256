// =============================================================================
// WebSocket feed — GET /ws/market-data (§6)
// =============================================================================
//
// Server pushes `{"type":"market_update", data, timestamp}` for every tick
// `MarketDataScheduler` broadcasts, and a `{"type":"portfolio_update", …}`
// alongside it when a snapshot is available. A client-sent `"ping"` gets a
// `{"type":"pong"}` reply. Any send/receive error drops the socket silently.
// No query-token gate: this feed is read-only market data, not the admin
// control surface.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::app_state::Services;

pub async fn ws_handler(ws: WebSocketUpgrade, State(services): State<Arc<Services>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, services))
}

async fn handle_connection(socket: WebSocket, services: Arc<Services>) {
    let (mut sender, mut receiver) = socket.split();
    let mut market_rx = services.market_data_scheduler.subscribe();

    info!("market-data websocket connection accepted");

    loop {
        tokio::select! {
            update = market_rx.recv() => {
                let Ok(update) = update else { break };
                let market_msg = json!({ "type": "market_update", "data": update, "timestamp": chrono::Utc::now() });
                if sender.send(Message::Text(market_msg.to_string().into())).await.is_err() {
                    break;
                }

                if let Ok(Some(portfolio)) = services.broker_handle.get_portfolio_snapshot().await {
                    let portfolio_msg = json!({ "type": "portfolio_update", "data": portfolio, "timestamp": chrono::Utc::now() });
                    if sender.send(Message::Text(portfolio_msg.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                        if sender.send(Message::Text(json!({ "type": "pong" }).to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "ignoring unrecognized websocket text frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    info!("market-data websocket connection closed");
}
