pub mod config;
pub mod error;
pub mod kv_store;
pub mod logging;
pub mod storage;
pub mod work_session_client;
