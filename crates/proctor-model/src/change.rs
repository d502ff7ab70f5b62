//! Who is writing and why

use std::fmt;

/// Credentials and attribution carried by every write
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeMetadata {
    /// SCM user performing the commit
    pub username: String,
    /// SCM password for `username`
    pub password: String,
    /// Person the change is attributed to, may differ from `username`
    pub author: String,
    /// Commit message
    pub comment: String,
}

impl ChangeMetadata {
    /// Metadata where the committer is also the author
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        let username = username.into();
        Self {
            author: username.clone(),
            username,
            password: password.into(),
            comment: comment.into(),
        }
    }

    /// With a distinct author
    #[inline]
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// With a different comment
    #[inline]
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Both username and password are non-blank
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.trim().is_empty()
    }
}

impl fmt::Debug for ChangeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeMetadata")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("author", &self.author)
            .field("comment", &self.comment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let meta = ChangeMetadata::new("alice", "hunter2", "msg");
        let rendered = format!("{meta:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(meta.author, "alice");
    }

    #[test]
    fn blank_credentials() {
        assert!(ChangeMetadata::new("alice", "pw", "").has_credentials());
        assert!(!ChangeMetadata::new("alice", " ", "").has_credentials());
        assert!(!ChangeMetadata::new("", "pw", "").has_credentials());
    }
}
