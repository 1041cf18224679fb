//! Motion profile helpers

pub mod easing;

pub use easing::Easing;
