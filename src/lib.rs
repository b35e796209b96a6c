// clipsync - Library root for testing

pub mod auth;
pub mod clippings;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
pub mod messaging;
pub mod middleware;
pub mod network;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod storage;
pub mod sync;
