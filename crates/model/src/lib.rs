pub mod block;
pub mod config;
pub mod model;

pub use block::DecoderBlock;
pub use config::ModelConfig;
pub use model::{Model, ModuleInfo};
