pub mod logging;
pub mod ticker;
