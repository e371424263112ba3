//! Shared harness for end-to-end epic tests.

use std::sync::Arc;

use handy_conductor::devops::operations::{
    DriverDeps, EpicDriver, SqlitePatternStore, StoreEscalations,
};
use handy_conductor::devops::sim::{
    SimulatedMailbox, SimulatedWorker, SimulatedWorld, SimulationScript,
};
use handy_conductor::devops::store::Store;
use handy_conductor::settings::{EngineSettings, WorkerBackendKind};

pub struct Harness {
    pub driver: EpicDriver,
    pub store: Arc<Store>,
    pub world: SimulatedWorld,
    pub settings: EngineSettings,
    _dir: tempfile::TempDir,
}

pub fn harness(script: &str) -> Harness {
    harness_with(script, |_| {})
}

pub fn harness_with(script: &str, tweak: impl FnOnce(&mut EngineSettings)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = EngineSettings {
        workspace_root: dir.path().join("workspaces"),
        inbox_dir: dir.path().join("inbox"),
        worker: WorkerBackendKind::Simulated,
        ..EngineSettings::default()
    };
    tweak(&mut settings);

    let store = Arc::new(Store::open_in_memory().unwrap());
    let world = SimulatedWorld::new();
    let registry = Arc::new(settings.stage_registry().unwrap());
    let deps = DriverDeps {
        store: store.clone(),
        backend: Arc::new(SimulatedWorker::new(
            world.clone(),
            SimulationScript::parse(script).unwrap(),
            registry,
        )),
        mailbox: Arc::new(SimulatedMailbox::new(world.clone())),
        escalations: Arc::new(StoreEscalations::new(store.clone())),
        patterns: Some(Arc::new(SqlitePatternStore::new(store.clone(), settings.pattern_limit))),
    };
    let driver = EpicDriver::new(&settings, deps).unwrap();

    Harness {
        driver,
        store,
        world,
        settings,
        _dir: dir,
    }
}

/// Stage names of every run, in order.
#[allow(dead_code)]
pub fn run_stages(store: &Store, epic_id: &str) -> Vec<String> {
    store
        .runs_for_epic(epic_id)
        .unwrap()
        .iter()
        .map(|r| r.stage_type.to_string())
        .collect()
}
