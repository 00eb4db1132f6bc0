pub mod batch;
pub mod detection;
pub mod job;
pub mod product;
pub mod upload;
