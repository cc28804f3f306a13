//! A single-threaded HTTP/1.x server built around a per-connection state machine.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod encoder;
pub mod handler;
pub mod handler_file;
pub mod header;
pub mod http;
pub mod iocache;
pub mod logger;
pub mod md5;
pub mod mime;
pub mod nonce;
pub mod server;
pub mod transport;
pub mod util;
pub mod validator;
pub mod vserver;
pub mod worker;
