//! Per-endpoint OAuth token persistence.
//!
//! One JSON file per endpoint under a per-user directory. Writes go through
//! write-temp + fsync + rename so a reader never observes a partial token
//! (cross-process safety); in-process writers additionally serialise through
//! a per-endpoint async lock map.

mod store;
mod token;

pub use store::TokenStore;
pub use store::TokenStoreError;
pub use token::Token;

/// Seconds of clock skew treated as "already expired" when deciding whether
/// to refresh.
pub const EXPIRY_SKEW_SECS: i64 = 60;
