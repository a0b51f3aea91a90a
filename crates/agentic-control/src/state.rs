use std::sync::Arc;

use agentic_supervisor::{OsProbe, ProcessProbe, ProcessRunner, StateStore};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub runner: ProcessRunner,
    pub probe: Arc<dyn ProcessProbe>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let probe = Arc::new(OsProbe::new(config.command_timeout));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: Config, probe: Arc<dyn ProcessProbe>) -> Self {
        let store = StateStore::new(&config.state_file);
        let runner = ProcessRunner::new(store.clone(), &config.log_dir, config.output_tail_chars);
        Self {
            config: Arc::new(config),
            store,
            runner,
            probe,
        }
    }
}
