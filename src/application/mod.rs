//! Application contracts: collaborator traits, the refresh operation and error mapping.

pub mod error;
pub mod refresh;
pub mod repos;
