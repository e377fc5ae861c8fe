pub mod backtester;
pub mod collector;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod grid;
pub mod metrics;
pub mod models;
pub mod runner;
pub mod signals;
pub mod tasks;
pub mod windows;
