//! Domain model module declarations.

pub mod container;
pub mod sandbox;
pub mod unit;
