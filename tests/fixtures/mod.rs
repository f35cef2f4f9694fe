//! Multi-node overlay fixtures

pub mod overlay;

pub use overlay::Overlay;
