pub mod app;
pub mod config;
pub mod decoder;
pub mod domain;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod matching;
pub mod merge;
pub mod orchestrator;
pub mod output;
pub mod overpass;
pub mod planner;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod sync_state;
