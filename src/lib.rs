pub mod bvh;
pub mod geometry;
pub mod scene;
pub mod sync;
pub mod util;

pub use scene::{Accel, Geometry, Hit, Scene};
