pub mod browser;
pub mod channel;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod jrtp;
pub mod judge;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod storage;
pub mod target;
pub mod task;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
