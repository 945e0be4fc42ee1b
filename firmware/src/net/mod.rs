//! Network-facing collaborators: Wi-Fi station, broker session, update
//! endpoint.

pub mod ota;
pub mod session;
pub mod wifi;
