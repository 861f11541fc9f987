pub mod actions;
pub mod admin;
pub mod health;
pub mod history;
pub mod records;
pub mod workflow;
