pub mod contract;
pub mod market;
pub mod projection;
pub mod summary;
