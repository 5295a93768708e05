pub mod forecast;
pub mod point;

pub use forecast::*;
pub use point::*;
