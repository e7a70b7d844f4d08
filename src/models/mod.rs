pub mod approval;
pub mod audit;
pub mod server;
