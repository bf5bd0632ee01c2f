// ABOUTME: Library root for sheet-sync
// ABOUTME: Spreadsheet to relational table sync engine, job scheduler and reaper

pub mod config;
pub mod db;
pub mod model;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod sync;
pub mod utils;
