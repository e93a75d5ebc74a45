//! Mathematical utilities and data structures

pub mod frustum;

pub use frustum::{Frustum, Plane};
