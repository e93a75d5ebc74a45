//! nxstream - view-dependent streaming of multiresolution mesh DAGs

pub mod core;
pub mod graph;
pub mod math;
pub mod stream;
