//! Data models for the drops mining agent.

pub mod campaign;
pub mod channel;
pub mod gql;

pub use campaign::*;
pub use channel::*;
pub use gql::*;
