pub mod billing;
pub mod events;
pub mod flat;
pub mod reading;
pub mod receipt;
pub mod settings;
pub mod user;
