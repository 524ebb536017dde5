//! HSM routing: generation, signing and agreement through a provider, and
//! fail-closed behaviour when the provider is missing or unreachable.

mod mocks;

use a2a_exchange::{EngineConfig, ExchangeError, KeyAlgorithm, KeyExchangeEngine, KeyOrigin};
use a2a_vault::{HsmConfig, HsmConfigUpdate};
use mocks::MockHsm;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn hsm_config(provider: &str) -> EngineConfig {
    EngineConfig {
        hsm: HsmConfig {
            enabled: true,
            provider: provider.to_string(),
            key_generation: true,
            key_storage: true,
            signing: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine_with(hsm: &Arc<MockHsm>) -> KeyExchangeEngine {
    KeyExchangeEngine::builder()
        .config(hsm_config("mock-hsm"))
        .hsm_provider(hsm.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_keys_are_generated_inside_the_hsm() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);

    let info = engine.generate_agent_key_pair("alice", None, None).await.unwrap();
    assert!(matches!(&info.origin, KeyOrigin::Hsm(handle) if handle.provider == "mock-hsm"));
    assert!(info.has_private_key());
    assert_eq!(hsm.generate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hsm.key_count(), 1);
    assert_eq!(engine.metrics().hsm_operations, 1);
}

#[tokio::test]
async fn test_exchange_runs_through_the_hsm() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);
    for agent in ["alice", "bob"] {
        engine.generate_agent_key_pair(agent, None, None).await.unwrap();
    }

    let request = engine.initiate_key_exchange("alice", "bob", vec![]).await.unwrap();
    let response = engine.respond_to_key_exchange(&request, true).await.unwrap();
    assert!(response.agreed);
    engine.confirm_key_exchange(&response).await.unwrap();

    // initiate and respond sign; respond and confirm agree
    assert_eq!(hsm.sign_calls.load(Ordering::SeqCst), 2);
    assert_eq!(hsm.agree_calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.metrics().hsm_operations, 6);
    assert!(engine.get_shared_secret("alice", "bob").is_ok());
}

#[tokio::test]
async fn test_unreachable_hsm_fails_closed_on_generation() {
    let hsm = MockHsm::new_unreachable("mock-hsm");
    let engine = engine_with(&hsm);

    let result = engine.generate_agent_key_pair("alice", None, None).await;
    assert!(matches!(result, Err(ExchangeError::HsmUnavailable(_))));
    assert!(matches!(
        engine.get_active_key("alice"),
        Err(ExchangeError::KeyNotFound(_))
    ));
    assert_eq!(engine.metrics().key_generations, 0);
    assert_eq!(hsm.key_count(), 0);
}

#[tokio::test]
async fn test_hsm_outage_after_generation_blocks_signing() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);
    for agent in ["alice", "bob"] {
        engine.generate_agent_key_pair(agent, None, None).await.unwrap();
    }

    hsm.set_reachable(false);
    assert!(matches!(
        engine.initiate_key_exchange("alice", "bob", vec![]).await,
        Err(ExchangeError::HsmUnavailable(_))
    ));
    assert!(engine.pending_requests().is_empty());

    hsm.set_reachable(true);
    assert!(engine.initiate_key_exchange("alice", "bob", vec![]).await.is_ok());
}

#[tokio::test]
async fn test_hsm_keys_never_fall_back_to_software_signing() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);
    for agent in ["alice", "bob"] {
        engine.generate_agent_key_pair(agent, None, None).await.unwrap();
    }

    engine
        .update_hsm_config(&HsmConfigUpdate {
            signing: Some(false),
            ..Default::default()
        })
        .unwrap();
    assert!(matches!(
        engine.initiate_key_exchange("alice", "bob", vec![]).await,
        Err(ExchangeError::HsmUnavailable(_))
    ));
    assert_eq!(hsm.sign_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_enabled_hsm_without_provider_fails_at_use() {
    let engine = KeyExchangeEngine::builder()
        .config(hsm_config("pkcs11"))
        .build()
        .unwrap();

    assert!(matches!(
        engine.generate_agent_key_pair("alice", None, None).await,
        Err(ExchangeError::HsmUnavailable(_))
    ));
}

#[test]
fn test_provider_name_must_match_config() {
    let hsm = MockHsm::new("mock-hsm");
    let built = KeyExchangeEngine::builder()
        .config(hsm_config("pkcs11"))
        .hsm_provider(hsm)
        .build();
    assert!(matches!(built, Err(ExchangeError::Validation(_))));
}

#[tokio::test]
async fn test_provider_switch_is_checked_on_update() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);

    let rejected = engine.update_hsm_config(&HsmConfigUpdate {
        provider: Some("cloudhsm".to_string()),
        ..Default::default()
    });
    assert!(matches!(rejected, Err(ExchangeError::Validation(_))));
    assert_eq!(engine.config().hsm.provider, "mock-hsm");

    let invalid = engine.update_hsm_config(&HsmConfigUpdate {
        key_storage: Some(false),
        ..Default::default()
    });
    assert!(matches!(invalid, Err(ExchangeError::Validation(_))));
    assert!(engine.config().hsm.key_storage);
}

#[tokio::test]
async fn test_adopt_provisioned_key() {
    let hsm = MockHsm::new("mock-hsm");
    let engine = engine_with(&hsm);
    let public_key = hsm.provision("slot/ops/legacy");

    let info = engine
        .adopt_hsm_key("ops", "slot/ops/legacy", public_key, KeyAlgorithm::Ecdh)
        .await
        .unwrap();
    assert_eq!(info.key_id, "slot/ops/legacy");
    assert!(matches!(info.origin, KeyOrigin::Hsm(_)));
    assert_eq!(engine.get_active_key("ops").unwrap().public_key, public_key);

    // The adopted key is usable for exchanges
    engine.generate_agent_key_pair("bob", None, None).await.unwrap();
    let request = engine.initiate_key_exchange("ops", "bob", vec![]).await.unwrap();
    let response = engine.respond_to_key_exchange(&request, true).await.unwrap();
    engine.confirm_key_exchange(&response).await.unwrap();

    assert!(matches!(
        engine
            .adopt_hsm_key("ops", "slot/ops/legacy", public_key, KeyAlgorithm::Ecdh)
            .await,
        Err(ExchangeError::Validation(_))
    ));
    assert!(matches!(
        engine
            .adopt_hsm_key("ghost", "slot/none", public_key, KeyAlgorithm::Ecdh)
            .await,
        Err(ExchangeError::HsmUnavailable(_))
    ));
}
