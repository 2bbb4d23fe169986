//! Credential store
//!
//! Keeps one salted PBKDF2-HMAC-SHA512 record per username. Records never
//! leave this module; callers only learn whether an operation succeeded.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::CredentialError;
use crate::types::UserId;

/// PBKDF2 iteration count
pub const HASH_ITERATIONS: u32 = 10_000;

/// Derived key length in bytes
pub const HASH_LEN: usize = 64;

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

struct CredentialRecord {
    user_id: UserId,
    salt: [u8; SALT_LEN],
    hash: [u8; HASH_LEN],
}

impl CredentialRecord {
    fn new(user_id: UserId, password: &str) -> Self {
        let mut record = Self {
            user_id,
            salt: [0u8; SALT_LEN],
            hash: [0u8; HASH_LEN],
        };
        record.set_password(password);
        record
    }

    /// Fresh salt, fresh hash
    fn set_password(&mut self, password: &str) {
        OsRng.fill_bytes(&mut self.salt);
        self.hash = derive(password, &self.salt);
    }

    fn matches(&self, password: &str) -> bool {
        let candidate = derive(password, &self.salt);
        candidate[..].ct_eq(&self.hash[..]).into()
    }
}

fn derive(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, HASH_ITERATIONS, &mut out);
    out
}

/// In-memory credential store keyed by username
///
/// Every username owns exactly one `UserId`, fixed at registration.
#[derive(Default)]
pub struct CredentialStore {
    records: HashMap<String, CredentialRecord>,
    owners: HashMap<UserId, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new username under `user_id` with a freshly salted hash
    ///
    /// Fails if the username exists, or if the id is reserved or already
    /// owned by another username.
    pub fn register(
        &mut self,
        username: &str,
        password: &str,
        user_id: UserId,
    ) -> Result<(), CredentialError> {
        if self.records.contains_key(username) {
            return Err(CredentialError::UsernameTaken);
        }
        if user_id == UserId::system() || self.owners.contains_key(&user_id) {
            return Err(CredentialError::IdentityTaken);
        }
        self.owners.insert(user_id.clone(), username.to_string());
        self.records
            .insert(username.to_string(), CredentialRecord::new(user_id, password));
        Ok(())
    }

    /// Check a password; unknown usernames simply fail
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.login(username, password).is_some()
    }

    /// The account's `UserId` if the password matches
    pub fn login(&self, username: &str, password: &str) -> Option<&UserId> {
        self.records
            .get(username)
            .filter(|record| record.matches(password))
            .map(|record| &record.user_id)
    }

    /// Username that registered the given id
    pub fn owner_of(&self, user_id: &UserId) -> Option<&str> {
        self.owners.get(user_id).map(String::as_str)
    }

    /// Rotate to a new salt and hash after re-checking the current password
    pub fn change_password(
        &mut self,
        username: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), CredentialError> {
        let record = self
            .records
            .get_mut(username)
            .ok_or(CredentialError::UnknownUser)?;
        if !record.matches(current_password) {
            return Err(CredentialError::WrongPassword);
        }
        record.set_password(new_password);
        Ok(())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.records.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
