//! Gatekeeping for the on-device inference model and the weekly usage credits
//! that meter paid remote operations.

pub mod core;
pub mod models;
pub mod quota;
pub mod store;

pub use crate::core::{app_state::Gatekeeper, settings::GatekeeperConfig};
