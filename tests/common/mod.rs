//! Shared helpers for integration tests: tempfile-backed stores, mock
//! backends, and a manager wired the way the supervisor wires it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aperture::agents::mock::MockBackend;
use aperture::agents::traits::AgentBackend;
use aperture::config::Config;
use aperture::core::runtime::RuntimeOptions;
use aperture::core::{
    AgentKind, ApiKeyRef, AuthMode, ManagerSettings, ProviderKey, SessionAuth, SessionManager,
};
use aperture::store::{SqliteStore, Store};
use aperture::vault::CredentialVault;
use aperture::worktree::StubWorktreeBroker;

pub const MASTER_KEY: &str = "test-master-key-0123456789abcdef!!";

/// Fast runtime knobs for tests.
pub fn test_runtime_options() -> RuntimeOptions {
    RuntimeOptions {
        idle_timeout: Duration::from_secs(30),
        rpc_timeout: Duration::from_secs(5),
        shutdown_deadline: Duration::from_secs(2),
        subscriber_buffer: 128,
    }
}

pub fn test_settings(max_concurrent: usize) -> ManagerSettings {
    ManagerSettings {
        max_concurrent,
        hosted_mode: true,
        allow_interactive: false,
        runtime: test_runtime_options(),
        worktree_base: PathBuf::from("/tmp/aperture-test-worktrees"),
    }
}

pub async fn memory_store() -> Arc<dyn Store> {
    Arc::new(SqliteStore::in_memory().await.expect("store"))
}

/// Manager over mock backends and a stub worktree broker.
pub async fn mock_manager(
    claude: MockBackend,
    pi: MockBackend,
    vault: Option<Arc<CredentialVault>>,
    max_concurrent: usize,
) -> (Arc<SessionManager>, Arc<dyn Store>) {
    let store = memory_store().await;
    let claude: Arc<dyn AgentBackend> = Arc::new(claude);
    let pi: Arc<dyn AgentBackend> = Arc::new(pi);
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        vault,
        Arc::new(StubWorktreeBroker::new()),
        claude,
        pi,
        test_settings(max_concurrent),
    ));
    (manager, store)
}

pub async fn temp_vault() -> (tempfile::TempDir, Arc<CredentialVault>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = CredentialVault::open(&dir.path().join("creds.bin"), MASTER_KEY)
        .await
        .expect("vault");
    (dir, Arc::new(vault))
}

pub fn inline_auth(provider: ProviderKey, key: &str) -> SessionAuth {
    SessionAuth {
        mode: AuthMode::ApiKey,
        provider_key: provider,
        api_key_ref: ApiKeyRef::Inline,
        api_key: Some(key.to_owned()),
        stored_credential_id: None,
    }
}

pub fn stored_auth(provider: ProviderKey, credential_id: &str) -> SessionAuth {
    SessionAuth {
        mode: AuthMode::ApiKey,
        provider_key: provider,
        api_key_ref: ApiKeyRef::Stored,
        api_key: None,
        stored_credential_id: Some(credential_id.to_owned()),
    }
}

pub fn oauth_auth(provider: ProviderKey) -> SessionAuth {
    SessionAuth {
        mode: AuthMode::Oauth,
        provider_key: provider,
        api_key_ref: ApiKeyRef::None,
        api_key: None,
        stored_credential_id: None,
    }
}

pub fn session_config(
    agent: AgentKind,
    auth: SessionAuth,
) -> aperture::core::SessionConfig {
    aperture::core::SessionConfig {
        agent,
        auth,
        workspace_id: None,
        env: HashMap::new(),
    }
}

/// Config for router tests, built without touching process env.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("APERTURE_API_TOKEN".to_owned(), "tok".to_owned());
    for (name, value) in overrides {
        vars.insert((*name).to_owned(), (*value).to_owned());
    }
    let lookup = move |name: &str| vars.get(name).cloned();
    Config::from_lookup(&lookup).expect("config")
}
