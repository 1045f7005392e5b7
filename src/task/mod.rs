pub mod collection;
pub mod handle;
pub mod types;


pub use collection::*;
pub use handle::*;
pub use types::*;
