use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    PersonalApiKey,
    OauthAccessToken,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PersonalApiKey => "personal_api_key",
            Self::OauthAccessToken => "oauth_access_token",
        }
    }
}

/// Caller identity resolved once per request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>, auth_method: AuthMethod) -> Self {
        Self {
            user_id: user_id.into(),
            team_id: None,
            auth_method,
            scopes: BTreeSet::new(),
            application_id: None,
        }
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.insert(scope.into());
        self
    }

    pub fn with_application(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Bearer tokens mapped to users from configuration.
#[derive(Clone, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, AuthenticatedUser>,
}

impl std::fmt::Debug for StaticKeyAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyAuthenticator")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl StaticKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(keys: &BTreeMap<String, AuthenticatedUser>) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|(token, user)| (token.clone(), user.clone()))
                .collect(),
        }
    }

    pub fn with_key(mut self, token: impl Into<String>, user: AuthenticatedUser) -> Self {
        self.keys.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<AuthenticatedUser> {
        self.keys.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_keys_resolve_configured_users() {
        let user = AuthenticatedUser::new("u-1", AuthMethod::OauthAccessToken)
            .with_team("team-a")
            .with_scope("llm_gateway:read");
        let auth = StaticKeyAuthenticator::new().with_key("tok-1", user.clone());

        assert_eq!(auth.authenticate("tok-1").await, Some(user));
        assert_eq!(auth.authenticate("tok-2").await, None);
        assert!(!format!("{auth:?}").contains("tok-1"));
    }

    #[test]
    fn auth_method_uses_snake_case_on_the_wire() {
        let raw = serde_json::json!({
            "user_id": "u-1",
            "auth_method": "personal_api_key",
            "scopes": ["a", "b"],
        });
        let user: AuthenticatedUser = serde_json::from_value(raw).expect("user");
        assert_eq!(user.auth_method, AuthMethod::PersonalApiKey);
        assert_eq!(user.scopes.len(), 2);
        assert_eq!(user.team_id, None);
    }
}
