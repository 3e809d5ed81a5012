pub mod ad_service;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod expiry;
pub mod handlers;
pub mod index;
pub mod lock;
pub mod models;
pub mod replication;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use ad_service::AdService;

#[derive(Clone)]
pub struct AppState {
    pub ads: Arc<AdService>,
}
