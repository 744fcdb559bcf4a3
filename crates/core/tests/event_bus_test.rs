// Integration tests for EventBus delivery while runs execute
//
// Run with: cargo test -p runloop-core --test event_bus_test

use runloop_core::{
    Agent, AgentConfig, AgentStore, BusConfig, EchoTool, EventBus, InMemoryStore, MockLlmDriver,
    MockLlmResponse, ModelAdapter, PriceTable, RecvError, RunMachine, RunStatus, RunStore,
    ToolRegistry, Trigger,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn setup(capacity: usize) -> (Arc<InMemoryStore>, Arc<MockLlmDriver>, RunMachine, Agent) {
    let store = InMemoryStore::shared();
    let driver = Arc::new(MockLlmDriver::new());
    let adapter = ModelAdapter::new(driver.clone(), Arc::new(PriceTable::with_defaults()));
    let bus = EventBus::new(
        store.clone(),
        BusConfig::default().with_queue_capacity(capacity),
    );
    let registry = ToolRegistry::builder().tool(EchoTool).build().unwrap();
    let machine = RunMachine::new(
        store.clone(),
        store.clone(),
        Arc::new(registry),
        Arc::new(adapter),
        bus,
    );

    let agent = Agent::new(
        "echoer",
        AgentConfig {
            allowed_tools: vec!["echo".to_string()],
            ..Default::default()
        },
    );
    store.create_agent(agent.clone()).await.unwrap();
    (store, driver, machine, agent)
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_is_disconnected_while_run_continues() {
    let (store, driver, machine, agent) = setup(3).await;
    for i in 0..4 {
        driver.push(
            MockLlmResponse::tool_call("echo", json!({ "message": format!("m{i}") }))
                .with_delay(Duration::from_millis(1)),
        );
    }
    driver.push(MockLlmResponse::text("done").with_delay(Duration::from_millis(1)));

    let run = machine
        .create(agent.id, Trigger::manual(None))
        .await
        .unwrap();

    let mut slow = machine.bus().subscribe();
    slow.watch_run(run.id).await.unwrap();

    let mut fast = machine.bus().subscribe();
    fast.watch_run(run.id).await.unwrap();
    let reader = tokio::spawn(async move {
        let mut sequences = Vec::new();
        loop {
            let event = fast.recv().await.unwrap();
            sequences.push(event.sequence);
            if event.is_terminal() {
                return sequences;
            }
        }
    });

    let finished = machine
        .advance(run.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    // created, four tool steps, the final model turn, completed
    let sequences = reader.await.unwrap();
    assert_eq!(sequences, (0..7).collect::<Vec<u64>>());

    // The disconnect reason wins over anything still buffered
    assert_eq!(slow.recv().await.unwrap_err(), RecvError::SlowConsumer);
    assert_eq!(slow.try_recv().unwrap_err(), RecvError::SlowConsumer);
    assert_eq!(machine.bus().subscriber_count(), 0);

    let stored = store.list_events(run.id, None).await.unwrap();
    assert_eq!(stored.len(), 7);
}

#[tokio::test]
async fn test_late_subscriber_replays_history() {
    let (_store, driver, machine, agent) = setup(16).await;
    driver.push(MockLlmResponse::text("done"));

    let run = machine
        .create(agent.id, Trigger::manual(None))
        .await
        .unwrap();
    machine
        .advance(run.id, &CancellationToken::new())
        .await
        .unwrap();

    let mut sub = machine.bus().subscribe();
    assert_eq!(sub.watch_run_after(run.id, Some(0)).await.unwrap(), 2);
    assert_eq!(sub.recv().await.unwrap().sequence, 1);
    let last = sub.recv().await.unwrap();
    assert_eq!(last.sequence, 2);
    assert!(last.is_terminal());
}
