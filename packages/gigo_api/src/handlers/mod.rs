pub mod broadcast;
pub mod health;

pub use broadcast::broadcast_ws_handler;
pub use health::{healthz_handler, metrics_handler, ping_handler};
