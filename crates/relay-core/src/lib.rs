pub mod events;
pub mod ids;
pub mod memory;
pub mod model;
pub mod providers;
