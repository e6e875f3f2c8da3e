//! Pairchat pairing server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod admin;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod matching;
pub mod moderation;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod verify;
pub mod ws;
