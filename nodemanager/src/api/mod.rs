//! HTTP and WebSocket surface of the supervisor

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use routes::AppState;
pub use server::{app, start_server};
pub use websocket::WsManager;
