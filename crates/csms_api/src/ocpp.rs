use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use csms_engine::{Engine, StationLink};
use futures_util::{SinkExt, StreamExt};

use crate::AppState;

/// WebSocket subprotocol spoken by stations.
pub const OCPP_PROTOCOL: &str = "ocpp1.6";

/// Upgrade a station connection and hand it to a station worker.
pub async fn connect_station(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.engine.store().contains_station(&station_id) {
        tracing::warn!(%station_id, "Connection from unregistered station");
    }
    ws.protocols([OCPP_PROTOCOL])
        .on_upgrade(move |socket| serve_station(state.engine, station_id, socket))
}

async fn serve_station(engine: Arc<Engine>, station_id: String, socket: WebSocket) {
    tracing::info!(%station_id, "Station connection open");
    let StationLink {
        inbound,
        mut outbound,
    } = engine.connect(&station_id);
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if inbound.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(%station_id, "Binary frame ignored");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%station_id, error = %err, "Connection error");
                break;
            }
        }
    }

    drop(inbound);
    writer.abort();
    tracing::info!(%station_id, "Station connection closed");
}
