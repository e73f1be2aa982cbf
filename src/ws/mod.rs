//! Real-time dispatch fabric: subscription hub + WebSocket endpoint.

pub mod handler;
pub mod hub;

pub use handler::websocket_handler;
pub use hub::SubscriptionHub;
