use std::fmt;

use serde::{Deserialize, Serialize};

/// Sample location and value, laid out the way device code reads it.
#[repr(C)]
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Distance in the xy plane; z is the sampled value, not a coordinate.
    #[inline(always)]
    pub fn planar_distance(&self, other: &Point) -> f32 {
        planar_distance(self.x, self.y, other.x, other.y)
    }
}

#[inline(always)]
pub fn planar_distance<T: num_traits::Float>(x0: T, y0: T, x1: T, y1: T) -> T {
    let dx = x0 - x1;
    let dy = y0 - y1;
    (dx * dx + dy * dy).sqrt()
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.x, self.y, self.z)
    }
}
