//! sproutd — coordination backend for plant-monitoring stations.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod listener;
pub mod pairing;
pub mod registry;
pub mod repo;
pub mod reports;
pub mod routes;
pub mod state;
pub mod stations;
pub mod ws;
