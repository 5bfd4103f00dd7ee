use std::fmt;

use serde::{Deserialize, Serialize};

/// Holds key material and wipes it when dropped.
///
/// Access goes through [`Secret::expose`] so reads of secret values stand out in review.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<T: zeroize::Zeroize>(T);

impl<T> Secret<T>
where
    T: zeroize::Zeroize,
{
    /// Create a new secret wrapper
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the wrapped value
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Mutably borrow the wrapped value
    pub fn expose_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for Secret<T>
where
    T: zeroize::Zeroize,
{
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> Drop for Secret<T>
where
    T: zeroize::Zeroize,
{
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T> fmt::Debug for Secret<T>
where
    T: zeroize::Zeroize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl<T> Serialize for Secret<T>
where
    T: zeroize::Zeroize + Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: zeroize::Zeroize + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Secret)
    }
}

pub use zeroize::Zeroize;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new([42u8; 32]);
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn test_secret_serde_is_transparent() {
        let secret = Secret::new(String::from("hunter2"));
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"hunter2\"");
        let back: Secret<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expose(), "hunter2");
    }

    #[test]
    fn test_secret_expose_mut() {
        let mut secret = Secret::new(vec![1u8, 2, 3]);
        secret.expose_mut().push(4);
        assert_eq!(secret.expose(), &vec![1, 2, 3, 4]);
    }
}
