pub mod chains;
pub mod config;
pub mod listeners;

pub use chains::build_chain_service;
pub use config::{
    ChainConfig, CustodyConfig, EngineConfig, LogFormat, QueueConfig, RedisConfig, ServerConfig,
};
pub use listeners::LoggingListener;
