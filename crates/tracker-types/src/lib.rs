mod job;
mod layer;
mod slice;
mod stream;

pub use job::*;
pub use layer::*;
pub use slice::*;
pub use stream::*;
