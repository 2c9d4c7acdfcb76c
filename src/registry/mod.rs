//! # Service Registry Module
//!
//! The concurrency-safe tenant → group → service → instance store and its
//! discovery dispatch between local load balancing and external registries.

pub mod cache;

pub use cache::{InstanceLocation, RegistryCache};
