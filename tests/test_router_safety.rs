//! Router behaviour: safety blocks, rate-limit rotation, exhaustion, and
//! conversation ordering.

use algoforge::keys::{KeyManager, KeyManagerConfig, KeyRecord, ModelPreference, WorkloadClass};
use algoforge::llm::{HeuristicEstimator, ProviderError, TokenEstimator, TurnRole};
use algoforge::router::{ChatRequest, RequestRouter, RouterConfig, RouterError};
use algoforge::testing::mocks::MockProvider;
use std::sync::Arc;
use std::time::Duration;

fn key(key_id: &str, model: &str, tags: &[&str], rpm: u32, tpm: u64) -> KeyRecord {
    KeyRecord {
        key_id: key_id.to_string(),
        credential: format!("cred-{key_id}"),
        model_name: model.to_string(),
        priority_tags: tags.iter().map(|t| t.to_string()).collect(),
        rpm_budget: rpm,
        tpm_budget: tpm,
        active: true,
    }
}

fn fast_config() -> RouterConfig {
    RouterConfig {
        max_attempts: 3,
        reserve_retries: 2,
        reserve_backoff: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
        ..RouterConfig::default()
    }
}

fn router_with(provider: MockProvider, keys: Vec<KeyRecord>) -> (Arc<RequestRouter>, Arc<KeyManager>) {
    let manager = Arc::new(KeyManager::new(keys, KeyManagerConfig::default()).unwrap());
    let router = Arc::new(RequestRouter::new(
        manager.clone(),
        Arc::new(provider),
        Box::new(HeuristicEstimator),
        fast_config(),
    ));
    (router, manager)
}

#[tokio::test]
async fn test_s4_safety_block_does_not_demote_key() {
    let provider = MockProvider::safety_block_then_success("fixed");
    let invocations = provider.invocations.clone();
    let (router, keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    let prompt = "rewrite the execution engine for aggressive order placement";
    let reply = router
        .send_one_shot(ChatRequest::new(prompt).with_workload(WorkloadClass::Light))
        .await
        .unwrap();

    assert_eq!(reply.content, "fixed");
    assert_eq!(reply.key_id, "k1");
    assert_eq!(invocations.lock().await.len(), 2);

    // The key survived the policy block untouched.
    let snapshot = keys.health();
    let k1 = snapshot.key("k1").unwrap();
    assert!(k1.healthy);
    assert!(!k1.in_cool_down);

    // TPM is debited exactly for the successful attempt: the sanitized
    // prompt estimate plus the actual completion.
    let estimator = HeuristicEstimator;
    let expected_completion = ("fixed".len() as u64).div_ceil(4);
    assert_eq!(
        k1.tpm_used,
        estimator.estimate(prompt) + expected_completion
    );
}

#[tokio::test]
async fn test_safety_block_falls_back_to_different_key_on_last_retry() {
    // Two blocks on the pinned key: the first retry stays on the same key
    // with an escalated tier, the last retry drops the pin and rotation
    // picks the untouched key.
    let provider = MockProvider::with_script(vec![
        Err(ProviderError::SafetyBlock {
            reason: "blocked".to_string(),
        }),
        Err(ProviderError::SafetyBlock {
            reason: "blocked".to_string(),
        }),
        Ok("recovered".to_string()),
    ]);
    let invocations = provider.invocations.clone();
    let (router, keys) = router_with(
        provider,
        vec![
            key("a", "gemini-2.0-flash", &["flash"], 10, 100_000),
            key("b", "gemini-2.0-flash", &["flash"], 10, 100_000),
        ],
    );

    let reply = router
        .send_one_shot(ChatRequest::new("describe the hedging rules").with_workload(WorkloadClass::Light))
        .await
        .unwrap();

    assert_eq!(reply.content, "recovered");
    assert_eq!(reply.key_id, "b");
    {
        let calls = invocations.lock().await;
        let credentials: Vec<&str> = calls.iter().map(|c| c.credential.as_str()).collect();
        assert_eq!(credentials, vec!["cred-a", "cred-a", "cred-b"]);
    }

    // Neither key was demoted along the way.
    let snapshot = keys.health();
    for key_id in ["a", "b"] {
        let k = snapshot.key(key_id).unwrap();
        assert!(k.healthy);
        assert!(!k.in_cool_down);
    }
}

#[tokio::test]
async fn test_safety_block_exhausts_after_two_retries() {
    let provider = MockProvider::with_script(vec![
        Err(ProviderError::SafetyBlock {
            reason: "blocked".to_string(),
        }),
        Err(ProviderError::SafetyBlock {
            reason: "blocked".to_string(),
        }),
        Err(ProviderError::SafetyBlock {
            reason: "blocked".to_string(),
        }),
    ]);
    let (router, keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    let err = router
        .send_one_shot(ChatRequest::new("some prompt"))
        .await
        .unwrap_err();
    match err {
        RouterError::SafetyBlocked { fingerprint } => {
            // Fingerprint only, never content.
            assert!(!fingerprint.contains("prompt"));
        }
        other => panic!("expected safety block, got {other}"),
    }

    // Still healthy after three blocks in a row.
    let k1 = keys.health();
    let k1 = k1.key("k1").unwrap();
    assert!(k1.healthy);
    assert!(!k1.in_cool_down);
}

#[tokio::test]
async fn test_s5_rate_limit_rotates_keys() {
    let provider = MockProvider::rate_limited_then_success("done");
    let invocations = provider.invocations.clone();
    let (router, keys) = router_with(
        provider,
        vec![
            key("a", "gemini-2.0-flash", &["flash"], 10, 100_000),
            key("b", "gemini-2.0-flash", &["flash"], 10, 100_000),
        ],
    );

    let reply = router
        .send_one_shot(ChatRequest::new("build a pairs trade"))
        .await
        .unwrap();

    assert_eq!(reply.content, "done");
    assert_eq!(reply.key_id, "b");
    {
        let calls = invocations.lock().await;
        assert_eq!(calls[0].credential, "cred-a");
        assert_eq!(calls[1].credential, "cred-b");
    }

    // A cooled down but healthy; B preferred while A recovers.
    let snapshot = keys.health();
    let a = snapshot.key("a").unwrap();
    assert!(a.healthy);
    assert!(a.in_cool_down);

    let reply = router
        .send_one_shot(ChatRequest::new("another request"))
        .await
        .unwrap();
    assert_eq!(reply.key_id, "b");
}

#[tokio::test]
async fn test_all_keys_exhausted_surfaces() {
    let provider = MockProvider::with_script(vec![
        Err(ProviderError::RateLimited("429".to_string())),
    ]);
    let (router, _keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    // The only key cools down after the 429; reservation then starves.
    let err = router
        .send_one_shot(ChatRequest::new("anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::AllKeysExhausted { .. }));
}

#[tokio::test]
async fn test_no_eligible_key_for_unknown_model() {
    let provider = MockProvider::always_succeeding("ok");
    let (router, _keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    let mut request = ChatRequest::new("anything");
    request.model_preference = ModelPreference::Exact("unknown-model".to_string());
    let err = router.send_one_shot(request).await.unwrap_err();
    assert!(matches!(err, RouterError::NoEligibleKey));
}

#[tokio::test]
async fn test_fatal_error_propagates_and_demotes() {
    let provider = MockProvider::with_script(vec![Err(ProviderError::Fatal(
        "invalid credential".to_string(),
    ))]);
    let (router, keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    let err = router
        .send_one_shot(ChatRequest::new("anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Fatal(_)));
    assert!(!keys.health().key("k1").unwrap().healthy);
}

#[tokio::test]
async fn test_conversation_turns_stay_ordered() {
    let provider = MockProvider::with_script(vec![
        Ok("a1".to_string()),
        Ok("a2".to_string()),
        Ok("a3".to_string()),
    ]);
    let invocations = provider.invocations.clone();
    let (router, _keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    for prompt in ["q1", "q2", "q3"] {
        router
            .send_chat(ChatRequest::new(prompt).in_conversation("conv-1"))
            .await
            .unwrap();
    }

    // The third call saw the first two exchanges, in order.
    let calls = invocations.lock().await;
    let turns = &calls[2].turns;
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["q1", "a1", "q2", "a2", "q3"]);
    assert_eq!(turns[0].role, TurnRole::User);
    assert_eq!(turns[1].role, TurnRole::Assistant);

    let health = router.health().await;
    assert_eq!(health.active_conversations, 1);
    assert_eq!(health.successes, 3);
}

#[tokio::test]
async fn test_one_shot_bypasses_conversation_memory() {
    let provider = MockProvider::always_succeeding("ok");
    let invocations = provider.invocations.clone();
    let (router, _keys) = router_with(
        provider,
        vec![key("k1", "gemini-2.0-flash", &["flash"], 10, 100_000)],
    );

    let mut request = ChatRequest::new("q1").in_conversation("conv-1");
    request.conversation_id = Some("conv-1".to_string());
    router.send_one_shot(request).await.unwrap();
    router
        .send_one_shot(ChatRequest::new("q2").in_conversation("conv-1"))
        .await
        .unwrap();

    // No history accumulated: each call carried only its own prompt.
    let calls = invocations.lock().await;
    assert_eq!(calls[1].turns.len(), 1);
    assert_eq!(router.health().await.active_conversations, 0);
}
