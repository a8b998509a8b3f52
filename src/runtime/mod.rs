pub mod blob;
pub mod context;
pub mod decider;
pub mod heartbeat;
pub mod history;
pub mod redis_storage;
pub mod registry;
pub mod storage;
pub mod task;
pub mod tree;
pub mod worker;
