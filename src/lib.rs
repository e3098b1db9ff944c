pub mod channel;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod indicator;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod storage;
pub mod template;
