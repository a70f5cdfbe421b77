pub mod agent;
pub mod error;
pub mod lifecycle;
pub mod mapper;
pub mod model;
pub mod runner;
pub mod store;
pub mod tools;
