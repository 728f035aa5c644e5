pub mod allocation;
pub mod memory;
pub mod state;
pub mod texture;
