pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod models;
pub mod prompt;
pub mod request;
pub mod serializer;
pub mod service;
