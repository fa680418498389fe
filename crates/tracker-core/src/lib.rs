pub mod cache;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod layers;
pub mod poller;
pub mod store;
pub mod timeline;

#[cfg(test)]
mod test_support;

pub use cache::*;
pub use completion::*;
pub use config::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use layers::*;
pub use poller::*;
pub use store::*;
pub use timeline::*;
