//! Feed session establishment

use super::FeedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct FeedSession {
    pub access_token: String,
    pub established_at: DateTime<Utc>,
}

impl std::fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSession")
            .field("access_token", &"<redacted>")
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// External login flow; called before every connect attempt
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn establish(&self) -> Result<FeedSession, FeedError>;
}

/// Token issued out-of-band (e.g. by a daily login script)
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl SessionAuthenticator for StaticTokenAuthenticator {
    async fn establish(&self) -> Result<FeedSession, FeedError> {
        if self.token.trim().is_empty() {
            return Err(FeedError::Auth("access token is empty".to_string()));
        }
        Ok(FeedSession {
            access_token: self.token.clone(),
            established_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let session = StaticTokenAuthenticator::new("abc").establish().await.unwrap();
        assert_eq!(session.access_token, "abc");
        assert!(!format!("{:?}", session).contains("abc"));

        assert!(matches!(
            StaticTokenAuthenticator::new("  ").establish().await,
            Err(FeedError::Auth(_))
        ));
    }
}
