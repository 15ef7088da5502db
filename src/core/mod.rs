pub mod builder;
pub mod callbacks;
mod execute;
pub mod globals;
mod operators;
pub mod output;
pub mod runner;
pub mod snapshot;
pub mod state;
pub mod story;
