pub mod frames;

pub use frames::{ServerFrame, TurnRequest};
