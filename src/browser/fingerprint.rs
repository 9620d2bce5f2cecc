use anyhow::Result;
use rand::{thread_rng, Rng};
use tracing::debug;

/// Picks the identity each new browsing context presents
#[derive(Debug, Clone)]
pub struct FingerprintManager {
    user_agents: Vec<String>,
}

impl FingerprintManager {
    pub fn new(user_agents: Vec<String>) -> Self {
        Self { user_agents }
    }

    /// Select a random user agent
    pub fn random_user_agent(&self) -> Result<&str> {
        if self.user_agents.is_empty() {
            anyhow::bail!("No user agents available");
        }

        let user_agent = &self.user_agents[thread_rng().gen_range(0..self.user_agents.len())];
        debug!("Selected user agent: {}", user_agent);

        Ok(user_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_user_agent_comes_from_pool() {
        let pool = vec!["ua-one".to_string(), "ua-two".to_string()];
        let manager = FingerprintManager::new(pool.clone());

        for _ in 0..20 {
            let picked = manager.random_user_agent().unwrap();
            assert!(pool.iter().any(|ua| ua == picked));
        }
    }

    #[test]
    fn test_empty_pool_is_an_error() {
        assert!(FingerprintManager::new(vec![]).random_user_agent().is_err());
    }
}
