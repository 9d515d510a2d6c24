//! SQLite storage for frozen predictions
//!
//! Once a race's predictions are frozen the rows can no longer be updated
//! or deleted; triggers enforce this inside the database itself.

pub mod repository;
pub mod schema;

pub use repository::PredictionRepository;
