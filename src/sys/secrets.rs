// src/sys/secrets.rs

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Random alphanumeric string drawn from the operating system CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A generated credential such as an app key or database password.
///
/// 1. `Debug` prints `[REDACTED]`, so it cannot leak through tracing fields.
/// 2. The backing memory is zeroized when the value is dropped.
/// 3. Serialization writes the plaintext on purpose: the secrets document is
///    the one place these values are meant to land.
#[derive(Clone)]
pub struct GeneratedSecret {
    value: SecretString,
}

impl GeneratedSecret {
    pub fn generate(len: usize) -> Self {
        Self::new(random_alphanumeric(len))
    }

    pub fn new(raw: String) -> Self {
        Self {
            value: SecretString::new(raw),
        }
    }

    /// Exposes the plaintext to `action` only; the borrow cannot escape.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.value.expose_secret())
    }
}

impl fmt::Debug for GeneratedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for GeneratedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.use_secret(|a| other.use_secret(|b| a == b))
    }
}

impl Serialize for GeneratedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.use_secret(|plain| serializer.serialize_str(plain))
    }
}

impl<'de> Deserialize<'de> for GeneratedSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}
