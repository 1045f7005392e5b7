pub mod events;
pub mod progress;
pub mod status;
pub mod task_group;


pub use events::*;
pub use progress::*;
pub use status::*;
pub use task_group::*;
