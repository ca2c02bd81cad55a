//! End-to-end scenarios for the single-process runtime

use async_trait::async_trait;
use selkie_runtime::LocalRuntime;
use selkie_core::{
    default_subscription, Agent, AgentId, AgentMetadata, AgentRuntime, CancellationToken, Error,
    Intervention, InterventionHandler, Message, MessageBody, MessageContext, Result, RoutedAgent,
    RuntimeState, Subscription, TopicId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Test messages and agents
// =============================================================================

#[derive(Clone)]
struct Ping(String);

impl MessageBody for Ping {
    fn type_name() -> &'static str {
        "Ping"
    }
}

#[derive(Clone)]
struct Pong(String);

impl MessageBody for Pong {
    fn type_name() -> &'static str {
        "Pong"
    }
}

struct Tick(u32);

impl MessageBody for Tick {
    fn type_name() -> &'static str {
        "Tick"
    }
}

/// Register an echo agent type that replies with its input and counts
/// instances and invocations.
async fn register_echo(
    runtime: &LocalRuntime,
    agent_type: &str,
    instances: Arc<AtomicU64>,
    invocations: Arc<AtomicU64>,
) {
    let factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        instances.fetch_add(1, Ordering::SeqCst);
        let invocations = Arc::clone(&invocations);
        Ok(Box::new(
            RoutedAgent::builder("echoes pings")
                .on::<Ping, _, _>(move |ping, _ctx| {
                    let invocations = Arc::clone(&invocations);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(Message::new(Pong(ping.0.clone()))))
                    }
                })
                .build(id),
        ))
    };
    runtime
        .register(agent_type, Box::new(factory), vec![])
        .await
        .unwrap();
}

// =============================================================================
// Echo scenario
// =============================================================================

#[tokio::test]
async fn echo_reply_and_per_key_instances() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(&runtime, "echo", Arc::clone(&instances), invocations).await;

    let reply = runtime
        .send(
            Message::new(Ping("ping".into())),
            AgentId::new("echo", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.downcast_ref::<Pong>().unwrap().0, "ping");

    // A second key creates a second instance.
    runtime
        .send(
            Message::new(Ping("again".into())),
            AgentId::new("echo", "k2").unwrap(),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 2);

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}

// =============================================================================
// P1: identity stability
// =============================================================================

#[tokio::test]
async fn resolve_or_create_is_idempotent() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(
        &runtime,
        "echo",
        Arc::clone(&instances),
        Arc::clone(&invocations),
    )
    .await;

    let a = runtime.resolve_or_create("echo", "k1").await.unwrap();
    let b = runtime.resolve_or_create("echo", "k1").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(instances.load(Ordering::SeqCst), 1);

    // Both ids route to the same underlying instance.
    for id in [&a, &b] {
        runtime
            .send(Message::new(Ping("x".into())), id.clone(), None, None)
            .await
            .unwrap();
    }
    assert_eq!(instances.load(Ordering::SeqCst), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    runtime.stop().await.unwrap();
}

// =============================================================================
// P2: mailbox FIFO
// =============================================================================

struct OrderRecorder {
    metadata: AgentMetadata,
    seen: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Agent for OrderRecorder {
    fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    async fn on_message(
        &mut self,
        message: Message,
        _context: &MessageContext,
    ) -> Result<Option<Message>> {
        let tick = message
            .downcast_ref::<Tick>()
            .ok_or_else(|| Error::handler_not_found(self.metadata.id().to_string(), message.type_name()))?;
        // Later ticks sleep less: out-of-order processing would reorder them.
        let delay = 40u64.saturating_sub(u64::from(tick.0) * 15);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.seen.lock().unwrap().push(tick.0);
        Ok(None)
    }
}

#[tokio::test]
async fn mailbox_is_fifo_per_recipient() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        Ok(Box::new(OrderRecorder {
            metadata: AgentMetadata::new(id, "records tick order"),
            seen: Arc::clone(&seen_in),
        }))
    };
    runtime
        .register("recorder", Box::new(factory), vec![default_subscription("recorder").boxed()])
        .await
        .unwrap();

    let topic = TopicId::default_for("s1").unwrap();
    for i in 0..3 {
        runtime
            .publish(Message::new(Tick(i)), topic.clone(), None, None)
            .await
            .unwrap();
    }

    runtime.run_until_idle().await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    runtime.stop().await.unwrap();
}

// =============================================================================
// P3: publish fan-out
// =============================================================================

#[tokio::test]
async fn publish_fans_out_once_per_matching_type() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let mut counters = Vec::new();
    for agent_type in ["alpha", "beta"] {
        let count = Arc::new(AtomicU64::new(0));
        counters.push(Arc::clone(&count));
        let factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
            let count = Arc::clone(&count);
            Ok(Box::new(
                RoutedAgent::builder("counts broadcasts")
                    .on::<Ping, _, _>(move |_ping, _ctx| {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(None)
                        }
                    })
                    .build(id),
            ))
        };
        runtime
            .register(
                agent_type,
                Box::new(factory),
                vec![default_subscription(agent_type).boxed()],
            )
            .await
            .unwrap();
    }

    // No subscription for gamma: it must see nothing.
    let gamma_count = Arc::new(AtomicU64::new(0));
    let gamma_in = Arc::clone(&gamma_count);
    let factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        let count = Arc::clone(&gamma_in);
        Ok(Box::new(
            RoutedAgent::builder("should never run")
                .on::<Ping, _, _>(move |_ping, _ctx| {
                    let count = Arc::clone(&count);
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                })
                .build(id),
        ))
    };
    runtime
        .register("gamma", Box::new(factory), vec![])
        .await
        .unwrap();

    runtime
        .publish(
            Message::new(Ping("hello".into())),
            TopicId::default_for("S").unwrap(),
            None,
            None,
        )
        .await
        .unwrap();
    runtime.run_until_idle().await;

    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1);
    assert_eq!(gamma_count.load(Ordering::SeqCst), 0);

    runtime.stop().await.unwrap();
}

// =============================================================================
// P4: drop semantics
// =============================================================================

struct DropAllSends;

#[async_trait]
impl InterventionHandler for DropAllSends {
    fn name(&self) -> &str {
        "drop-all-sends"
    }

    async fn on_send(
        &self,
        _message: Message,
        _sender: Option<&AgentId>,
        _recipient: &AgentId,
    ) -> Intervention {
        Intervention::Drop
    }
}

#[tokio::test]
async fn dropped_send_never_reaches_the_agent() {
    let runtime = LocalRuntime::builder()
        .with_intervention(Arc::new(DropAllSends))
        .build();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(
        &runtime,
        "echo",
        instances,
        Arc::clone(&invocations),
    )
    .await;

    let err = runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("echo", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageDropped { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_publish_is_silent() {
    struct DropAllPublishes;

    #[async_trait]
    impl InterventionHandler for DropAllPublishes {
        fn name(&self) -> &str {
            "drop-all-publishes"
        }

        async fn on_publish(&self, _message: Message, _sender: Option<&AgentId>) -> Intervention {
            Intervention::Drop
        }
    }

    let runtime = LocalRuntime::builder()
        .with_intervention(Arc::new(DropAllPublishes))
        .build();
    runtime.start().unwrap();

    // A subscribed listener that would receive the broadcast if it were
    // not vetoed.
    let invocations = Arc::new(AtomicU64::new(0));
    let invocations_in = Arc::clone(&invocations);
    let factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        let invocations = Arc::clone(&invocations_in);
        Ok(Box::new(
            RoutedAgent::builder("counts broadcasts")
                .on::<Ping, _, _>(move |_ping, _ctx| {
                    let invocations = Arc::clone(&invocations);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                })
                .build(id),
        ))
    };
    runtime
        .register(
            "listener",
            Box::new(factory),
            vec![default_subscription("listener").boxed()],
        )
        .await
        .unwrap();

    // The publish succeeds from the caller's point of view.
    runtime
        .publish(
            Message::new(Ping("x".into())),
            TopicId::default_for("S").unwrap(),
            None,
            None,
        )
        .await
        .unwrap();
    runtime.run_until_idle().await;
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    runtime.stop().await.unwrap();
}

// =============================================================================
// P5: cancellation propagation
// =============================================================================

#[tokio::test]
async fn cancelled_send_resolves_cancelled() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let factory = |id: &AgentId| -> Result<Box<dyn Agent>> {
        Ok(Box::new(
            RoutedAgent::builder("sleeps forever")
                .on::<Ping, _, _>(|_ping, _ctx| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(None)
                })
                .build(id),
        ))
    };
    runtime
        .register("sleepy", Box::new(factory), vec![])
        .await
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("sleepy", "k1").unwrap(),
            None,
            Some(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    runtime.run_until_idle().await;
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn linked_tokens_cancel_nested_sends() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    // Inner sleeps; outer forwards to inner with a child token and records
    // the nested outcome.
    let inner_factory = |id: &AgentId| -> Result<Box<dyn Agent>> {
        Ok(Box::new(
            RoutedAgent::builder("slow inner")
                .on::<Ping, _, _>(|_ping, _ctx| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(None)
                })
                .build(id),
        ))
    };
    runtime
        .register("inner", Box::new(inner_factory), vec![])
        .await
        .unwrap();

    let nested_results: Arc<Mutex<Vec<Result<Option<Message>>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let nested_in = Arc::clone(&nested_results);
    let handle = runtime.clone();
    let outer_factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        let handle = handle.clone();
        let nested = Arc::clone(&nested_in);
        Ok(Box::new(
            RoutedAgent::builder("forwards to inner")
                .on::<Ping, _, _>(move |ping, ctx| {
                    let handle = handle.clone();
                    let nested = Arc::clone(&nested);
                    async move {
                        let child = ctx.cancellation.child_token();
                        let result = handle
                            .send(
                                Message::new(Ping(ping.0.clone())),
                                AgentId::new("inner", "k1")?,
                                None,
                                Some(child),
                            )
                            .await;
                        nested.lock().unwrap().push(result);
                        Ok(None)
                    }
                })
                .build(id),
        ))
    };
    runtime
        .register("outer", Box::new(outer_factory), vec![])
        .await
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let err = runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("outer", "k1").unwrap(),
            None,
            Some(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    runtime.run_until_idle().await;
    let nested = nested_results.lock().unwrap();
    assert_eq!(nested.len(), 1);
    assert!(matches!(nested[0], Err(Error::Cancelled)));

    runtime.stop().await.unwrap();
}

// =============================================================================
// Registration and lifecycle errors
// =============================================================================

#[tokio::test]
async fn duplicate_registration_fails() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(&runtime, "echo", Arc::clone(&instances), invocations.clone()).await;

    let factory = |_id: &AgentId| -> Result<Box<dyn Agent>> {
        Err(Error::internal("never constructed"))
    };
    let err = runtime
        .register("echo", Box::new(factory), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration { .. }));

    // The original registration still works.
    runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("echo", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap();

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_recipient_fails_the_send_only() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(&runtime, "echo", instances, invocations).await;

    let err = runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("nobody", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRecipient { .. }));

    // The runtime is still healthy.
    let reply = runtime
        .send(
            Message::new(Ping("still-up".into())),
            AgentId::new("echo", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.downcast_ref::<Pong>().unwrap().0, "still-up");

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_runtime_refuses_intake() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();
    runtime.stop().await.unwrap();

    let err = runtime
        .send(
            Message::new(Ping("x".into())),
            AgentId::new("echo", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeStopped));
}

#[tokio::test]
async fn nested_sends_do_not_deadlock() {
    let runtime = LocalRuntime::new();
    runtime.start().unwrap();

    let instances = Arc::new(AtomicU64::new(0));
    let invocations = Arc::new(AtomicU64::new(0));
    register_echo(&runtime, "inner", instances, invocations).await;

    let handle = runtime.clone();
    let outer_factory = move |id: &AgentId| -> Result<Box<dyn Agent>> {
        let handle = handle.clone();
        Ok(Box::new(
            RoutedAgent::builder("forwards and returns the inner reply")
                .on::<Ping, _, _>(move |ping, _ctx| {
                    let handle = handle.clone();
                    async move {
                        let reply = handle
                            .send(
                                Message::new(Ping(ping.0.clone())),
                                AgentId::new("inner", "k1")?,
                                None,
                                None,
                            )
                            .await?;
                        Ok(reply)
                    }
                })
                .build(id),
        ))
    };
    runtime
        .register("outer", Box::new(outer_factory), vec![])
        .await
        .unwrap();

    let reply = runtime
        .send(
            Message::new(Ping("through".into())),
            AgentId::new("outer", "k1").unwrap(),
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.downcast_ref::<Pong>().unwrap().0, "through");

    runtime.stop().await.unwrap();
}
