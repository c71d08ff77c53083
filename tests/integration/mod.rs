mod orchestrator_scenarios;
mod registry_sync;
