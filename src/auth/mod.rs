// Authentication module
// Manages the credential lifecycle and its persistence

mod credentials;
mod jwt;
mod manager;
mod refresh;
mod session;
mod types;

pub use credentials::CredentialStore;
pub use manager::{credential_expiry, AuthManager, RefreshOutcome};
pub use types::{Credential, Profile};
