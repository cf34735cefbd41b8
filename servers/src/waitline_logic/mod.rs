pub mod config;
pub mod downstream;
pub mod reaper;
pub mod state;
