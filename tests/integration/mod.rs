//! Integration test suite for swarm.
//!
//! These tests drive the scheduler, governor, wrapper and repair ladder
//! together through the public API. Collaborators are scripted, so no
//! external toolchain or real host pressure is involved.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: construct, verify and repair against a real directory
//! - `properties`: proptest checks over generated graphs
//! - `recovery`: monitor failure, resource exhaustion, panics, cancellation
//! - `repair_ladder`: escalation, exhaustion and the success shortcut
//! - `scheduling`: dependency order, partial failure, budget limits

mod fixtures;

mod pipeline_e2e;
mod repair_ladder;
