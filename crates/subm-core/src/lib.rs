pub mod artifact;
pub mod config;
pub mod events;
pub mod policy;
pub mod status;
pub mod types;
pub mod validation;

pub use artifact::*;
pub use config::*;
pub use events::*;
pub use policy::*;
pub use status::*;
pub use types::*;
pub use validation::*;
