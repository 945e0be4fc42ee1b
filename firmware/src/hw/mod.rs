//! LilyGO T-Beam board bindings.
//!
//! Pins: LED on GPIO4, PMU IRQ (active low) on GPIO35, user button on GPIO38
//! (RTC-capable, deep-sleep wake), PMU I2C on GPIO21/22.

pub mod power;
pub mod rng;
