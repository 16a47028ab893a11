//! Domain layer - Core recovery model
//!
//! Entities, repository traits and services. Nothing here touches a
//! device or the filesystem directly.

pub mod entities;
pub mod repositories;
pub mod services;
