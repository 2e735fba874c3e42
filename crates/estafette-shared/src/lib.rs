//! # estafette-shared
//!
//! Domain model types shared between the Estafette store and the upper
//! layers of the client SDK.  Everything here is a plain serde-derived
//! struct or enum; storage logic lives in `estafette-store`.

pub mod constants;
pub mod types;

pub use types::*;
