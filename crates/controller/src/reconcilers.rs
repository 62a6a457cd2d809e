pub mod cluster;
pub mod conditions;
pub mod node;
pub mod status;
pub mod workers;
