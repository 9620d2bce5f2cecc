pub mod results;
pub mod sites;

// Re-export common types
pub use results::ResultWriter;
pub use sites::load_tasks;
