//! WebSocket endpoint for market data streaming.
//!
//! Clients speak `{action, channel}` JSON: subscribe / unsubscribe / ping.
//! Channels:
//!   quote:{id}  depth:{id}:{levels}  trades:{id}  candles:{id}:{timeframe}
//!   status:{id}  orders:{user_id}  biome_market_all  biome_market:{biome}
//! Bare `unsubscribe` drops every subscription. Server events carry a
//! `type` and an ISO-8601 UTC `timestamp`.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::auth::models::Claims;
use crate::biome::Biome;
use crate::pricing::Timeframe;

/// Validate a channel name. `claims` gates the private `orders:` rooms.
fn validate_channel(channel: &str, claims: Option<&Claims>) -> Result<(), String> {
    if channel == "biome_market_all" {
        return Ok(());
    }

    let parts: Vec<&str> = channel.split(':').collect();
    match parts.as_slice() {
        ["biome_market", biome] => match Biome::from_str(biome) {
            Some(_) => Ok(()),
            None => Err(format!("unknown biome: {biome}")),
        },
        ["quote", id] | ["trades", id] | ["status", id] => {
            Uuid::parse_str(id).map(|_| ()).map_err(|_| format!("invalid instrument_id: {id}"))
        }
        ["depth", id] | ["depth", id, _] => {
            Uuid::parse_str(id).map_err(|_| format!("invalid instrument_id: {id}"))?;
            if let ["depth", _, levels] = parts.as_slice() {
                match levels.parse::<usize>() {
                    Ok(n) if (1..=50).contains(&n) => {}
                    _ => return Err(format!("invalid depth levels: {levels}")),
                }
            }
            Ok(())
        }
        ["candles", id, timeframe] => {
            Uuid::parse_str(id).map_err(|_| format!("invalid instrument_id: {id}"))?;
            match Timeframe::from_str(timeframe) {
                Some(_) => Ok(()),
                None => Err(format!("invalid timeframe: {timeframe}")),
            }
        }
        ["orders", user_id] => match claims {
            Some(claims) if claims.sub == *user_id => Ok(()),
            Some(_) => Err("orders channel is limited to your own user".into()),
            None => Err("orders channel requires authentication".into()),
        },
        _ => Err(format!("invalid channel: {channel}")),
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
) -> Response {
    let claims = claims.map(|Extension(c)| c);
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Option<Claims>) {
    let (conn_id, mut outbound) = state.hub.attach();
    let (mut sender, mut receiver) = socket.split();
    info!(conn = %conn_id, "🔌 WebSocket connected");

    loop {
        tokio::select! {
            // Fan-out from the hub's bounded queue.
            maybe_event = outbound.recv() => {
                let Some(event) = maybe_event else { break };
                if sender.send(Message::Text(event)).await.is_err() {
                    break;
                }
            }
            // Client protocol messages.
            maybe_msg = receiver.next() => {
                let Some(Ok(msg)) = maybe_msg else { break };
                match msg {
                    Message::Text(text) => {
                        let reply = handle_client_message(&state, conn_id, &text, claims.as_ref());
                        if let Some(reply) = reply {
                            if sender.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.detach(conn_id);
    info!(conn = %conn_id, "WebSocket disconnected");
}

fn handle_client_message(
    state: &AppState,
    conn_id: Uuid,
    text: &str,
    claims: Option<&Claims>,
) -> Option<serde_json::Value> {
    let Ok(message) = serde_json::from_str::<serde_json::Value>(text) else {
        return Some(json!({ "type": "error", "message": "invalid JSON" }));
    };
    let action = message.get("action").and_then(|a| a.as_str());
    let channel = message.get("channel").and_then(|c| c.as_str());

    match action {
        Some("subscribe") => {
            let Some(channel) = channel else {
                return Some(json!({ "type": "error", "message": "channel required for subscribe" }));
            };
            if let Err(reason) = validate_channel(channel, claims) {
                return Some(json!({ "type": "error", "message": reason }));
            }
            state.hub.subscribe(conn_id, channel);
            debug!(conn = %conn_id, channel, "Subscribed");
            Some(json!({ "type": "subscribed", "channel": channel }))
        }
        Some("unsubscribe") => match channel {
            Some(channel) => {
                state.hub.unsubscribe(conn_id, channel);
                Some(json!({ "type": "unsubscribed", "channel": channel }))
            }
            None => {
                state.hub.unsubscribe_all(conn_id);
                Some(json!({ "type": "unsubscribed", "message": "unsubscribed from all channels" }))
            }
        },
        Some("ping") => Some(json!({ "type": "pong" })),
        Some(other) => Some(json!({ "type": "error", "message": format!("unknown action: {other}") })),
        None => Some(json!({ "type": "error", "message": "action required" })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::UserRole;

    fn claims_for(user: Uuid) -> Claims {
        Claims {
            sub: user.to_string(),
            username: "u".into(),
            role: UserRole::Trader,
            session_id: Uuid::new_v4().to_string(),
            exp: 0,
        }
    }

    #[test]
    fn test_validate_biome_channels() {
        assert!(validate_channel("biome_market_all", None).is_ok());
        assert!(validate_channel("biome_market:ocean", None).is_ok());
        assert!(validate_channel("biome_market:lava", None).is_err());
    }

    #[test]
    fn test_validate_instrument_channels() {
        let id = Uuid::new_v4().to_string();
        assert!(validate_channel(&format!("quote:{id}"), None).is_ok());
        assert!(validate_channel(&format!("trades:{id}"), None).is_ok());
        assert!(validate_channel(&format!("depth:{id}:5"), None).is_ok());
        assert!(validate_channel(&format!("depth:{id}:0"), None).is_err());
        assert!(validate_channel(&format!("candles:{id}:1m"), None).is_ok());
        assert!(validate_channel(&format!("candles:{id}:7m"), None).is_err());
        assert!(validate_channel("quote:not-a-uuid", None).is_err());
        assert!(validate_channel("bogus:whatever", None).is_err());
    }

    #[test]
    fn test_orders_channel_requires_matching_user() {
        let user = Uuid::new_v4();
        let channel = format!("orders:{user}");
        assert!(validate_channel(&channel, None).is_err());
        assert!(validate_channel(&channel, Some(&claims_for(user))).is_ok());
        assert!(validate_channel(&channel, Some(&claims_for(Uuid::new_v4()))).is_err());
    }
}
