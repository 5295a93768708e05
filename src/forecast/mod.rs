pub mod features;
pub mod pipeline;
pub mod quantile;
pub mod weather;

pub use features::*;
pub use pipeline::*;
pub use quantile::*;
pub use weather::*;
