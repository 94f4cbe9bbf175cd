//! Two-phase commit across the fragment nodes, plus the pieces it runs on:
//! configuration, routing, transport, fault hooks and recovery.

pub mod coordinator;
pub mod dist_config;
pub mod fault;
pub mod history;
pub mod network;
pub mod participant;
pub mod recovery;
pub mod routing;
