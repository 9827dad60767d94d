pub mod config;
pub mod error;
pub mod judge;
pub mod language;
pub mod reclaimer;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod workspace;
