pub mod failures;
pub mod setup;
pub mod sync;
