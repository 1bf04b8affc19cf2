//! End-to-end scenarios over the in-memory drivers and repositories

use async_trait::async_trait;
use portal_platform::audit::{AuditOptions, AuditService, DeadLetterEntry};
use portal_platform::cache::{CacheService, MemoryDriver};
use portal_platform::context::{self, ContextOverrides, TenantId};
use portal_platform::crypto::{CryptoError, KeyRing};
use portal_platform::database::{JobDlqRepo, MemoryAuditRepo, MemoryJobDlqRepo};
use portal_platform::error::Error;
use portal_platform::resilience::{BreakerConfig, BreakerPolicy, Resilience, RunOptions};
use portal_platform::ws::{self, Inbound, SocketIo, WsError, WsService, WsSettings};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn tenant_555() -> TenantId {
    "00000000-0000-7000-8000-000000000555"
        .parse::<TenantId>()
        .unwrap()
}

#[tokio::test]
async fn s1_missing_session_fails_auth() {
    let overrides = ContextOverrides {
        request_id: Some(portal_platform::context::RequestId::generate()),
        session: None,
        ..Default::default()
    };
    let err = context::within(tenant_555(), overrides, async {
        context::session_or_fail().unwrap_err()
    })
    .await;
    match err {
        Error::Auth { reason, .. } => assert!(reason.contains("Missing session")),
        other => panic!("expected Auth, got {other:?}"),
    }
}

#[tokio::test]
async fn s2_tampered_ciphertext_fails_op() {
    let ring = KeyRing::from_keys(vec![(1, [0x41; 32])]).unwrap();
    let mut ciphertext = ring.encrypt(b"hello", None).unwrap();
    ciphertext[13] ^= 0x01;
    assert_eq!(
        ring.decrypt(&ciphertext, None).unwrap_err(),
        CryptoError::OpFailed
    );
}

#[tokio::test]
async fn s3_circuit_trips_after_three_failures() {
    let resilience = Resilience::new();
    let options = RunOptions {
        circuit: Some(BreakerConfig {
            policy: BreakerPolicy::Consecutive { threshold: 3 },
            half_open_after: Duration::from_secs(60),
            persist: false,
            metrics: false,
        }),
        ..RunOptions::default()
    };

    for _ in 0..3 {
        let result = resilience
            .run("downstream", options.clone(), || async {
                Err::<(), _>(Error::infra("boom"))
            })
            .await;
        assert!(result.is_err());
    }

    let err = resilience
        .run("downstream", options, || async { Ok("ok") })
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "CircuitError");
}

#[tokio::test]
async fn s4_glob_metacharacters_are_escaped() {
    let cache = CacheService::new(Arc::new(MemoryDriver::new())).with_store("store");
    cache.set("u.s$r:3", &1u32, Duration::from_secs(60)).await.unwrap();
    cache.set("user:1", &1u32, Duration::from_secs(60)).await.unwrap();

    assert_eq!(cache.invalidate_local("store", "u.s$r:*"), 1);
    assert_eq!(cache.invalidate_local("unknown_store", "*"), 0);
}

#[tokio::test]
async fn s5_dead_letter_replay_accounting() {
    let repo = Arc::new(MemoryAuditRepo::new());
    let dlq = Arc::new(MemoryJobDlqRepo::new());
    let audit = AuditService::new(repo.clone(), dlq.clone());

    // Park one valid entry by failing the store during a write.
    let tenant = TenantId::new(Uuid::from_u128(5));
    repo.set_failing(true);
    context::within(tenant, ContextOverrides::default(), async {
        audit.log("app.update", AuditOptions::default()).await
    })
    .await
    .unwrap();
    repo.set_failing(false);

    // And one poison payload.
    dlq.push(DeadLetterEntry::new(
        "audit.update",
        serde_json::json!({"bad": true}),
        "seed",
    ))
    .await
    .unwrap();

    let outcome = audit.replay_dead_letters(10).await.unwrap();
    assert_eq!(outcome.replayed, 1);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.skipped);

    let outcome = audit.replay_dead_letters(10).await.unwrap();
    assert_eq!(outcome.replayed, 0);
    assert_eq!(outcome.failed, 0);
    assert!(outcome.skipped);
}

struct ScriptedIo {
    inbound: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedIo {
    fn new(messages: &[Inbound]) -> Self {
        Self {
            inbound: messages
                .iter()
                .map(|m| ws::encode_inbound(m).unwrap())
                .collect(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl SocketIo for ScriptedIo {
    async fn next_text(&mut self) -> Option<Result<String, WsError>> {
        self.inbound.pop_front().map(Ok)
    }

    async fn send_text(&mut self, text: String) -> Result<(), WsError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

#[tokio::test]
async fn s6_socket_lifecycle_terminates_cleanly() {
    let cache = CacheService::new(Arc::new(MemoryDriver::new()));
    let service = WsService::new(WsSettings::default(), cache).unwrap();
    let tenant = TenantId::new(Uuid::from_u128(0x56));

    let io = ScriptedIo::new(&[
        Inbound::Join {
            room_id: "r1".into(),
        },
        Inbound::Send {
            room_id: "r1".into(),
            data: serde_json::json!("hi"),
        },
        Inbound::Leave {
            room_id: "r1".into(),
        },
    ]);
    let sent = io.sent.clone();

    service.serve(io, tenant, "user-1".into()).await.unwrap();

    assert_eq!(service.socket_count(), 0);
    assert!(service.room_members(tenant, "r1").await.is_empty());
    assert!(service
        .presence()
        .get_all(tenant)
        .await
        .unwrap()
        .is_empty());

    // No error frames crossed the wire.
    for raw in sent.lock().unwrap().iter() {
        let frame = ws::decode_outbound(raw).unwrap();
        assert!(
            !matches!(frame, ws::Outbound::Error { .. }),
            "unexpected error frame: {frame:?}"
        );
    }
}
