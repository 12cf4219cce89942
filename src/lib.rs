//! Delivery core library
//!
//! Consistency core of a food-delivery backend: order totals and restaurant
//! ratings are kept in step with their child rows by hooks that run inside the
//! mutating transaction, and order placement writes the order, its line items
//! and a pending payment atomically.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod pricing;
pub mod services;

pub use errors::ServiceError;
pub use services::{ServiceContainer, ServiceFactory};
