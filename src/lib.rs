pub mod error;
pub mod like_store;
pub mod llm;
pub mod middleware;
pub mod routes;
pub mod settings;
pub mod utility;
