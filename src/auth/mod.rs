// Key/credential store (spec §6 "Persisted state" / "Key material", §9). Three pieces:
// `crypto` implements the versioned `enc:v2:...` / `enc:v3:...` private-key encoding, `users`
// persists the `{fullName, publicKey, privateKey, setupComplete, createdAt}` record in SQLite,
// and `keystore` is the in-memory, TTL-bounded cache of decrypted key material that `Identity`
// selection (`crate::http::AppState::resolve_identity`) reads from.

pub mod crypto;
pub mod keystore;
pub mod users;

pub use crypto::{CryptoError, KeyFormat};
pub use keystore::SessionKeyStore;
pub use users::{UserRecord, UserStore};
