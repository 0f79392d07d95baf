pub(crate) mod clock;
pub mod logger;
pub mod shutdown;
