//! WebSocket session handlers: agents on `/websocket`, UI subscribers on
//! `/ws/ui`.

pub mod agent;
pub mod subscriber;
