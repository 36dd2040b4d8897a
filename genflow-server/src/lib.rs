pub mod auth;
pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod rate;
pub mod server;
pub mod stages;
pub mod stream;
pub mod ttl;
pub mod web;
