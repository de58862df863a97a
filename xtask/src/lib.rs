pub mod tasks;

pub type DynError = Box<dyn std::error::Error>;
