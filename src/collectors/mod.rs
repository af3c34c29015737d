/// Fixed-interval sampling of process and host resource metrics
mod resource;

pub use resource::ResourceCollector;
