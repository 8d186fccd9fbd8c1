//! Identities, tokens, wire messages and status codes shared by every
//! mixcomms crate.

pub mod id;
pub mod messages;
pub mod status;
pub mod token;

pub use id::{Id, IdError, IdType};
pub use status::{Code, Status};
pub use token::{Nonce, Token, TokenError};
