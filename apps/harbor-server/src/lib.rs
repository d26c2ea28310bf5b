pub mod config;
pub mod crypto;
pub mod encode;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod updates;
