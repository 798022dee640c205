pub mod common;
pub mod logging;

pub use common::{ConfigArgs, WorkDirArgs};
pub use logging::{init_tracing, InitError};
