pub mod alerter;
pub mod audit;
pub mod collector;
pub mod commands;
pub mod config;
pub mod cooldown;
pub mod miner;
pub mod models;
pub mod rate;
pub mod recovery;
pub mod regression;
pub mod report;
pub mod router;
pub mod service;
pub mod service_control;
pub mod sources;
pub mod stall;
