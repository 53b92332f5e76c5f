//! admin HTTP surface exposing pipeline state and runtime-config
//! controls.

pub mod server;
