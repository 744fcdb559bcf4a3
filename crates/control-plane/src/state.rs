// Shared application state
//
// Built once at startup from the storage backend and the model driver. The
// run machine, event bus and supervisor inside are shared by every handler.

use runloop_core::{
    AgentStore, EventBus, LlmDriver, ModelAdapter, PriceTable, RunMachine, RunStore,
    ScheduleStore, ToolRegistry,
};
use runloop_storage::StorageBackend;
use runloop_worker::{RunSupervisor, RuntimeConfig};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub agents: Arc<dyn AgentStore>,
    pub runs: Arc<dyn RunStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub supervisor: Arc<RunSupervisor>,
    pub storage_mode: &'static str,
    /// Deadline for each WebSocket write
    pub ws_write_timeout: Duration,
}

impl AppState {
    /// Wire the run machine, event bus and supervisor over `storage`
    pub fn build(
        storage: &StorageBackend,
        driver: Arc<dyn LlmDriver>,
        prices: PriceTable,
        tools: ToolRegistry,
        config: &RuntimeConfig,
    ) -> Self {
        let runs = storage.runs();
        let adapter =
            ModelAdapter::new(driver, Arc::new(prices)).with_config(config.adapter_config());
        let bus = EventBus::new(runs.clone(), config.bus_config());
        let machine = RunMachine::new(
            storage.agents(),
            runs.clone(),
            Arc::new(tools),
            Arc::new(adapter),
            bus,
        )
        .with_config(config.machine_config());

        Self {
            agents: storage.agents(),
            runs,
            schedules: storage.schedules(),
            supervisor: Arc::new(RunSupervisor::new(Arc::new(machine))),
            storage_mode: storage.name(),
            ws_write_timeout: config.subscriber_write_timeout,
        }
    }

    pub fn machine(&self) -> &RunMachine {
        self.supervisor.machine()
    }

    pub fn bus(&self) -> &EventBus {
        self.machine().bus()
    }
}
