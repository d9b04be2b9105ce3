// Storage layer: database lifecycle and money representation.

pub mod database;

pub use database::{money, Database};
