pub mod auth;
pub mod booking;
pub mod config;
pub mod engine;
pub mod hours;
pub mod jobs;
pub mod lanes;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sink;
pub mod sql;
pub mod templates;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
