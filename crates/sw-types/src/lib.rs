pub mod errors;
pub mod job;
pub mod params;
pub mod resources;
pub mod result;

pub use errors::*;
pub use job::*;
pub use params::*;
pub use resources::*;
pub use result::*;
