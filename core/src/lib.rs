pub mod analysis;
pub mod auth;
pub mod error;
pub mod grounding;
pub mod quota;
pub mod truth;
