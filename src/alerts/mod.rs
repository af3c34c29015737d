/// Alert event lifecycle: idempotent firing, resolution and bounded history
mod alert_manager;

pub use alert_manager::{AlertEvent, AlertManager};
