/// Span recording and trace forest reconstruction
mod recorder;

pub use recorder::{SpanHandle, SpanNode, Trace, TraceRecorder};
