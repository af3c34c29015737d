/// Append-only, retention-bounded time series storage
mod time_series;

pub use time_series::{LabelFilter, RetentionPolicy, TimeSeriesStore};
