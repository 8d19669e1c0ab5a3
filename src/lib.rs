pub mod agent;
pub mod clock;
pub mod config;
pub mod event;
pub mod export;
pub mod generator;
pub mod migrate;
pub mod pipeline;
pub mod sink;
pub mod source;
