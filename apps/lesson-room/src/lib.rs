pub mod api;
pub mod config;
pub mod media;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod view;
