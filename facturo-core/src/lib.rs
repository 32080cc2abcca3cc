pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod notifications;
pub mod service;
pub mod store;
pub mod worker;
