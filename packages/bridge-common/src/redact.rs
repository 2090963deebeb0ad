//! Keeps secrets (database URLs, admin tokens, signing keys) out of logs and JSON.

use std::fmt::{self, Debug, Display};

/// Wrapper whose `Debug`, `Display` and `Serialize` output is always `"<redacted>"`.
///
/// ```
/// use bridge_common::Redacted;
///
/// let token = Redacted("admin-secret".to_string());
/// assert_eq!(format!("{:?}", token), "<redacted>");
/// assert_eq!(token.expose(), "admin-secret");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Borrow the wrapped secret
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> serde::Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        "<redacted>".serialize(serializer)
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Redacted(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_hides_value() {
        let secret = Redacted("postgres://user:pass@db/bridge");
        assert_eq!(format!("{:?}", secret), "<redacted>");
        assert_eq!(format!("{}", secret), "<redacted>");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<redacted>\"");
        assert_eq!(*secret.expose(), "postgres://user:pass@db/bridge");
    }
}
