pub mod bootstrap;
pub mod commands;
pub mod sync_bridge;
pub mod timer_context;
