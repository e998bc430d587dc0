pub mod dtype;
pub mod shape;

pub use dtype::{DType, Element};
pub use shape::{Axes, Shape};
