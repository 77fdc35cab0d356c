pub mod chart;
pub mod config;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod llm;
pub mod safety;
pub mod schema;
pub mod service;
pub mod session;
pub mod store;

pub use config::ServiceConfig;
pub use error::{AskdbError, Result};
pub use service::KpiService;
