pub mod config;
pub mod delegate;
pub mod error;
pub mod identifier;
pub mod ledger;
pub mod migrations;
pub mod runner;
pub mod seed;
