pub mod resource;
pub mod status;
pub mod transition;
pub mod types;

#[cfg(test)]
mod tests;

pub use resource::*;
pub use status::*;
pub use transition::*;
pub use types::*;
