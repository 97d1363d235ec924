//! Boundary loading, reprojection and query encoding.

pub mod encode;
pub mod gpkg;
pub mod loader;
pub mod prj;
pub mod reproject;

pub use encode::{encode, QueryGeometry};
pub use loader::{load_boundary, BoundaryFormat};
pub use reproject::reproject;
