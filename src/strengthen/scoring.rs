//! Password scoring

use async_trait::async_trait;

/// Highest strength score
pub const MAX_SCORE: u8 = 4;

/// Rates password strength on a 0..=4 scale
#[async_trait]
pub trait PasswordScorer: Send + Sync {
    /// Never fails: scoring errors rate as 0
    async fn score(&self, password: &str) -> u8;
}

/// Scorer backed by zxcvbn's pattern matching estimator
#[derive(Debug, Default, Clone, Copy)]
pub struct ZxcvbnScorer;

impl ZxcvbnScorer {
    fn score_blocking(password: &str) -> u8 {
        match zxcvbn::zxcvbn(password, &[]) {
            Ok(entropy) => entropy.score().min(MAX_SCORE),
            Err(e) => {
                tracing::debug!("Scoring failed, rating as 0: {}", e);
                0
            }
        }
    }
}

#[async_trait]
impl PasswordScorer for ZxcvbnScorer {
    async fn score(&self, password: &str) -> u8 {
        let password = password.to_string();
        tokio::task::spawn_blocking(move || Self::score_blocking(&password))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Scoring task failed: {}", e);
                0
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_weak_password_scores_low() {
        assert!(ZxcvbnScorer.score("password").await <= 1);
    }

    #[tokio::test]
    async fn test_strong_password_scores_high() {
        assert!(ZxcvbnScorer.score("v7#Qm!2zLp@9Rw$xT4").await >= 3);
    }

    #[tokio::test]
    async fn test_empty_password_scores_zero() {
        assert_eq!(ZxcvbnScorer.score("").await, 0);
    }

    #[tokio::test]
    async fn test_score_within_range() {
        for pw in ["a", "correcthorsebatterystaple", "Tr0ub4dor&3", "🔒🔑"] {
            assert!(ZxcvbnScorer.score(pw).await <= MAX_SCORE);
        }
    }
}
