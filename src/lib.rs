//! Shelf photo import
//!
//! Turns batches of grocery shelf photos into draft catalog products: hosted
//! vision models detect and identify each product, public product databases
//! confirm it, and every result lands in the catalog as a draft for review.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
