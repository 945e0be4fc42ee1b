#![no_std]

// Shared logic for the soil-sensor node.
//
// Every component is a state machine generic over the collaborator traits it
// needs, so the same code runs on the ESP32 board, in the host emulator, and
// under the integration tests.

pub mod button;
pub mod config;
pub mod connectivity;
pub mod cycle;
pub mod events;
pub mod power;
pub mod sensors;
pub mod update;

use core::time::Duration;

/// Milliseconds for a [`DelayNs`](embedded_hal_async::delay::DelayNs) call,
/// saturating at `u32::MAX`.
pub(crate) fn delay_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
