pub mod export_results;
pub mod simulate;
