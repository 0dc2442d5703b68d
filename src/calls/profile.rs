//! Display data for call parties.

use async_trait::async_trait;
use callcore::{UserId, UserProfile};
use std::collections::HashMap;

/// Identity/profile service. Consulted for display only; a missing profile
/// never affects a call.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn lookup(&self, user_id: &UserId) -> Option<UserProfile>;
}

/// Fixed set of profiles, for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    profiles: HashMap<UserId, UserProfile>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        self.profiles.insert(
            user_id.clone(),
            UserProfile {
                user_id,
                display_name: display_name.into(),
                avatar_url: None,
            },
        );
        self
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn lookup(&self, user_id: &UserId) -> Option<UserProfile> {
        self.profiles.get(user_id).cloned()
    }
}
