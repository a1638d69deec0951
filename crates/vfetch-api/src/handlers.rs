//! Request handlers.

pub mod fetch;
pub mod health;
pub mod index;
pub mod jobs;
pub mod tools;

pub use fetch::*;
pub use health::*;
pub use index::*;
pub use jobs::*;
pub use tools::*;
