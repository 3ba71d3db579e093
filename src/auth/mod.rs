pub mod credential;
pub mod token_store;

pub use credential::Credential;
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
