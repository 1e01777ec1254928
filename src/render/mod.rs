pub(crate) mod barrier;
pub(crate) mod config;
pub(crate) mod ipc;
pub(crate) mod pipeline;
pub(crate) mod planner;
pub(crate) mod pool;
pub(crate) mod worker;
