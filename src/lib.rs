//! Core library for the `fleetsim` CLI.
//!
//! A coordinator drives distributed tests through a fixed sequence of phases
//! on workers that per-machine agents spawn and supervise. Every node is
//! named by a hierarchical [`address::SimulatorAddress`] and talks over one
//! binary frame protocol; messages are routed hop by hop and their responses
//! are correlated back to the caller.
pub mod address;
pub mod agent;
pub mod args;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod correlation;
pub mod entry;
pub mod error;
pub mod failure;
pub mod metronome;
pub mod performance;
pub mod phases;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod system;
pub mod worker;
