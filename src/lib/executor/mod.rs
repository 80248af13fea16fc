pub mod executor;
pub mod locks;
pub mod types;
