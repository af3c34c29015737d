/// Snapshot rendering in exposition, structured and JSON formats
mod exporter;

/// HTTP scrape endpoint serving the exposition rendering
pub mod scrape;

pub use exporter::{ExportFilter, ExportFormat, Exporter, ResourceRecord, SeriesRecord};
