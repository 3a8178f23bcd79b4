pub mod admin;
pub mod employee;
pub mod events;
pub mod public;
