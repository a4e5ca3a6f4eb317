pub mod state;
pub use state::IngestionStateStore;
