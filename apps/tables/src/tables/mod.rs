pub mod definition;
pub mod migrator;
pub mod physical;
pub mod registry;
pub mod resolver;
pub mod rows;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;


pub use service::{TablePolicyConfig, TablesError, TablesService};
