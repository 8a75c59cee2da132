//! Process lifecycle for the long-running `serve` mode.

pub mod shutdown;
