pub mod analytics;
pub mod client;
pub mod model;
pub mod trajectory;
