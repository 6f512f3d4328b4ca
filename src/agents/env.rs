//! Session environment isolation.
//!
//! The gateway process environment is never forwarded wholesale to a backend
//! session: every provider-secret variable is stripped, the user-supplied
//! `env` map is filtered, and at most one provider key (the resolved key for
//! the session's own provider) is injected. Backends spawn their SDK with
//! `env_clear()` plus exactly the map built here.

use std::collections::HashMap;
use thiserror::Error;

use crate::core::session::{AuthMode, SessionAuth};

/// Google-cloud credential variables that do not match the `*_API_KEY`
/// suffix but still carry provider secrets (Pi's Google path).
const GOOGLE_CLOUD_VARS: &[&str] = &["GOOGLE_APPLICATION_CREDENTIALS", "GOOGLE_CLOUD_PROJECT"];

/// Whether a variable name carries a provider secret.
#[must_use]
pub fn is_provider_secret(name: &str) -> bool {
    name.ends_with("_API_KEY") || GOOGLE_CLOUD_VARS.contains(&name)
}

/// A rejected user-supplied environment variable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvRejection {
    /// Provider-secret variables are not accepted in oauth mode.
    #[error("environment variable '{name}' is not permitted in oauth mode")]
    SecretInOauthMode {
        /// The rejected variable.
        name: String,
    },

    /// A provider-secret variable for a different provider than the session's.
    #[error("environment variable '{name}' does not match session provider '{provider}'")]
    InconsistentProvider {
        /// The rejected variable.
        name: String,
        /// The session's provider.
        provider: String,
    },
}

/// Build the environment for a backend session.
///
/// `parent` is the gateway's own environment, `user_env` the session's
/// requested overrides, `resolved_key` the session's API key (present
/// exactly in `api_key` mode).
///
/// # Errors
///
/// Returns the first rejected user variable; rejection happens at session
/// creation, never at first use.
pub fn build_session_env(
    parent: impl IntoIterator<Item = (String, String)>,
    auth: &SessionAuth,
    resolved_key: Option<&str>,
    user_env: &HashMap<String, String>,
) -> Result<HashMap<String, String>, EnvRejection> {
    // Gateway-level provider secrets never reach a session.
    let mut env: HashMap<String, String> = parent
        .into_iter()
        .filter(|(name, _)| !is_provider_secret(name))
        .collect();

    for (name, value) in user_env {
        if is_provider_secret(name) {
            match auth.mode {
                AuthMode::Oauth => {
                    return Err(EnvRejection::SecretInOauthMode { name: name.clone() });
                }
                AuthMode::ApiKey => {
                    if name != auth.provider_key.env_var() {
                        return Err(EnvRejection::InconsistentProvider {
                            name: name.clone(),
                            provider: auth.provider_key.to_string(),
                        });
                    }
                }
            }
        }
        env.insert(name.clone(), value.clone());
    }

    // The resolved key wins over any user-supplied value for the same
    // variable; it is the key the session was admitted with.
    if auth.mode == AuthMode::ApiKey {
        if let Some(key) = resolved_key {
            env.insert(auth.provider_key.env_var().to_owned(), key.to_owned());
        }
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{ApiKeyRef, ProviderKey};

    fn parent_env() -> Vec<(String, String)> {
        vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("HOME".to_owned(), "/home/gw".to_owned()),
            ("ANTHROPIC_API_KEY".to_owned(), "sk-env".to_owned()),
            ("OPENAI_API_KEY".to_owned(), "sk-oai-env".to_owned()),
            ("GOOGLE_APPLICATION_CREDENTIALS".to_owned(), "/creds.json".to_owned()),
        ]
    }

    fn api_key_auth(provider: ProviderKey) -> SessionAuth {
        SessionAuth {
            mode: AuthMode::ApiKey,
            provider_key: provider,
            api_key_ref: ApiKeyRef::Inline,
            api_key: None,
            stored_credential_id: None,
        }
    }

    fn oauth_auth(provider: ProviderKey) -> SessionAuth {
        SessionAuth {
            mode: AuthMode::Oauth,
            provider_key: provider,
            api_key_ref: ApiKeyRef::None,
            api_key: None,
            stored_credential_id: None,
        }
    }

    #[test]
    fn test_gateway_secrets_are_stripped() {
        let auth = oauth_auth(ProviderKey::Anthropic);
        let env = build_session_env(parent_env(), &auth, None, &HashMap::new()).unwrap();
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert!(!env.contains_key("GOOGLE_APPLICATION_CREDENTIALS"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[test]
    fn test_resolved_key_replaces_gateway_key() {
        // The auth-bleed scenario: the gateway env holds sk-env; the session
        // was created with a different key. The session must see exactly its
        // own key.
        let auth = api_key_auth(ProviderKey::Anthropic);
        let env =
            build_session_env(parent_env(), &auth, Some("sk-session"), &HashMap::new()).unwrap();
        assert_eq!(
            env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-session")
        );
        // No other provider key survives.
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }

    #[test]
    fn test_user_secret_for_other_provider_is_rejected() {
        let auth = api_key_auth(ProviderKey::Anthropic);
        let mut user_env = HashMap::new();
        user_env.insert("OPENAI_API_KEY".to_owned(), "sk-user".to_owned());
        let result = build_session_env(parent_env(), &auth, Some("sk-session"), &user_env);
        assert_eq!(
            result,
            Err(EnvRejection::InconsistentProvider {
                name: "OPENAI_API_KEY".to_owned(),
                provider: "anthropic".to_owned(),
            })
        );
    }

    #[test]
    fn test_user_secret_in_oauth_mode_is_rejected() {
        let auth = oauth_auth(ProviderKey::Anthropic);
        let mut user_env = HashMap::new();
        user_env.insert("ANTHROPIC_API_KEY".to_owned(), "sk-user".to_owned());
        let result = build_session_env(parent_env(), &auth, None, &user_env);
        assert_eq!(
            result,
            Err(EnvRejection::SecretInOauthMode {
                name: "ANTHROPIC_API_KEY".to_owned(),
            })
        );
    }

    #[test]
    fn test_consistent_user_secret_is_overridden_by_resolved_key() {
        let auth = api_key_auth(ProviderKey::Anthropic);
        let mut user_env = HashMap::new();
        user_env.insert("ANTHROPIC_API_KEY".to_owned(), "sk-user".to_owned());
        let env = build_session_env(parent_env(), &auth, Some("sk-resolved"), &user_env).unwrap();
        assert_eq!(
            env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-resolved")
        );
    }

    #[test]
    fn test_benign_user_env_passes_through() {
        let auth = oauth_auth(ProviderKey::Openai);
        let mut user_env = HashMap::new();
        user_env.insert("MY_FLAG".to_owned(), "1".to_owned());
        let env = build_session_env(parent_env(), &auth, None, &user_env).unwrap();
        assert_eq!(env.get("MY_FLAG").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_google_cloud_names_are_secrets() {
        assert!(is_provider_secret("GOOGLE_APPLICATION_CREDENTIALS"));
        assert!(is_provider_secret("GOOGLE_CLOUD_PROJECT"));
        assert!(is_provider_secret("GEMINI_API_KEY"));
        assert!(is_provider_secret("ANTHROPIC_API_KEY"));
        assert!(!is_provider_secret("PATH"));
        assert!(!is_provider_secret("API_KEY_SUFFIX_NOT"));
    }
}
