//! Login policy behaviour across the three login modes

use async_trait::async_trait;
use rusty_sessions::auth::{AuthManager, Device, Identity, LoginRequest, TokenStyle};
use rusty_sessions::config::{AuthConfig, LoginMode};
use rusty_sessions::core::{AuthEvent, AuthEventKind, AuthListener};
use rusty_sessions::error::ErrorKind;
use rusty_sessions::storage::create_memory_store;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Recorder {
    events: Mutex<Vec<AuthEvent>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }

    fn kinds(&self) -> Vec<AuthEventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn tokens(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.token.clone()).collect()
    }
}

#[async_trait]
impl AuthListener for Recorder {
    async fn on_event(&self, event: &AuthEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manager(mode: LoginMode) -> AuthManager {
    init_logging();
    let config = AuthConfig::new("k")
        .with_login_mode(mode)
        .with_access_ttl(Duration::from_secs(3600));
    AuthManager::new(config, create_memory_store()).unwrap()
}

fn plain_jwt_manager(mode: LoginMode) -> AuthManager {
    init_logging();
    let config = AuthConfig::new("k")
        .with_login_mode(mode)
        .with_token_style(TokenStyle::Jwt);
    AuthManager::new(config, create_memory_store()).unwrap()
}

fn login(user_id: u64, device: Device) -> LoginRequest {
    LoginRequest::new(Identity::new(user_id, format!("user{}", user_id), device))
}

#[tokio::test]
async fn test_single_mode_scenario() {
    let manager = manager(LoginMode::Single);
    let recorder = Recorder::new();
    manager.subscribe(recorder.clone());

    let t1 = manager.login(login(1, Device::Web)).await.unwrap();
    let t2 = manager.login(login(1, Device::App)).await.unwrap();

    let err = manager.validate(&t1.access_token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenNotFound);
    assert_eq!(manager.validate(&t2.access_token).await.unwrap().user_id(), 1);

    let t3 = manager.refresh(&t2.refresh_token).await.unwrap();
    assert!(manager.validate(&t2.access_token).await.is_err());

    let record = manager.validate(&t3.access_token).await.unwrap();
    assert_eq!(record.user_id(), 1);
    assert_eq!(record.device(), Device::App);
    assert_eq!(record.refresh_token, t3.refresh_token);

    manager.events().flush().await;
    assert_eq!(
        recorder.kinds(),
        vec![
            AuthEventKind::Login,
            AuthEventKind::Kickout,
            AuthEventKind::Login,
            AuthEventKind::Refresh,
        ]
    );
    let tokens = recorder.tokens();
    assert_eq!(tokens[1], t1.access_token);
    assert_eq!(tokens[2], t2.access_token);
    assert_eq!(tokens[3], t3.access_token);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_mode_keeps_one_session_under_concurrency() {
    let manager = Arc::new(manager(LoginMode::Single));

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let manager = Arc::clone(&manager);
        let device = if i % 2 == 0 { Device::Web } else { Device::App };
        handles.push(tokio::spawn(async move { manager.login(login(1, device)).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(manager.store().tokens_of(1).await.unwrap().len(), 1);
    assert_eq!(manager.sessions_of(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_mode_grows_without_eviction() {
    let manager = manager(LoginMode::Multi);
    let recorder = Recorder::new();
    manager.subscribe(recorder.clone());

    let mut issued = Vec::new();
    for expected in 1..=4 {
        issued.push(manager.login(login(2, Device::Web)).await.unwrap());
        assert_eq!(manager.store().tokens_of(2).await.unwrap().len(), expected);
    }
    for pair in &issued {
        assert!(manager.validate(&pair.access_token).await.is_ok());
    }

    manager.events().flush().await;
    assert!(recorder.kinds().iter().all(|k| *k == AuthEventKind::Login));
}

#[tokio::test]
async fn test_exclusive_mode_evicts_same_device_only() {
    let manager = manager(LoginMode::Exclusive);
    let recorder = Recorder::new();
    manager.subscribe(recorder.clone());

    let web1 = manager.login(login(3, Device::Web)).await.unwrap();
    let app = manager.login(login(3, Device::App)).await.unwrap();
    let web2 = manager.login(login(3, Device::Web)).await.unwrap();

    assert_eq!(
        manager.validate(&web1.access_token).await.unwrap_err().kind(),
        ErrorKind::TokenNotFound
    );
    assert!(manager.validate(&app.access_token).await.is_ok());
    assert!(manager.validate(&web2.access_token).await.is_ok());
    assert_eq!(manager.store().tokens_of(3).await.unwrap().len(), 2);

    manager.events().flush().await;
    assert_eq!(
        recorder.kinds(),
        vec![
            AuthEventKind::Login,
            AuthEventKind::Login,
            AuthEventKind::Kickout,
            AuthEventKind::Login,
        ]
    );
    assert_eq!(recorder.tokens()[2], web1.access_token);
}

#[tokio::test]
async fn test_other_users_are_untouched() {
    let manager = manager(LoginMode::Single);
    let bob = manager.login(login(10, Device::Web)).await.unwrap();
    manager.login(login(11, Device::Web)).await.unwrap();
    manager.login(login(11, Device::App)).await.unwrap();

    assert!(manager.validate(&bob.access_token).await.is_ok());
    assert!(manager.is_online(10).await.unwrap());
}

#[tokio::test]
async fn test_plain_jwt_logins_in_one_second_stay_distinct() {
    let manager = plain_jwt_manager(LoginMode::Multi);

    let first = manager.login(login(2, Device::Web)).await.unwrap();
    let second = manager.login(login(2, Device::Web)).await.unwrap();
    assert_ne!(first.access_token, second.access_token);
    assert_eq!(manager.store().tokens_of(2).await.unwrap().len(), 2);

    // Both sessions keep working refresh tokens
    assert!(manager.refresh(&first.refresh_token).await.is_ok());
    assert!(manager.refresh(&second.refresh_token).await.is_ok());
}

#[tokio::test]
async fn test_plain_jwt_single_mode_evicts_previous_token() {
    let manager = plain_jwt_manager(LoginMode::Single);

    let first = manager.login(login(3, Device::Web)).await.unwrap();
    let second = manager.login(login(3, Device::Web)).await.unwrap();

    let err = manager.validate(&first.access_token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenNotFound);
    assert_eq!(manager.validate(&second.access_token).await.unwrap().user_id(), 3);
    assert_eq!(manager.store().tokens_of(3).await.unwrap(), vec![second.access_token]);
}
