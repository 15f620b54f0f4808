#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Shared logic for the bilateral haptic controller pair.
//
// The crate stays portable across MCU firmware and host tooling by avoiding the
// Rust standard library. Transport, actuator and clock access are reached
// through the traits in `dispatcher` and `controller`; everything else is
// plain bounded state driven by a cooperative `poll(now)` loop.

pub mod battery;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dispatcher;
pub mod pattern;
pub mod phone;
pub mod session;
pub mod telemetry;
pub mod therapy;
pub mod time;
