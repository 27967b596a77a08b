// ABOUTME: Secret encryption and runner credential handling for Stratus
// ABOUTME: Provides the secret-bundle cipher and bearer token hashing

pub mod encryption;
pub mod tokens;

// Re-export main types for convenience
pub use encryption::{EncryptionError, SecretsCipher};
pub use tokens::{generate_runner_token, hash_token, verify_token, TokenGeneration};
