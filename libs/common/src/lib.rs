mod container;
mod domain;
mod events;
mod image;
mod route;

pub use container::*;
pub use domain::*;
pub use events::*;
pub use image::*;
pub use route::*;
