pub mod engine;

pub use engine::{SessionProviders, StreamEngine};
