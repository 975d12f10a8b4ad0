pub mod args;
pub mod attachments;
pub mod checkpoint;
pub mod config;
pub mod mapper;
pub mod migrate;
pub mod reconnect;
pub mod remote;
pub mod stats;
pub mod transport;
