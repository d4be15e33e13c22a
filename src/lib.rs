pub mod attachments;
pub mod catalog;
pub mod errors;
pub mod models;
pub mod providers;
