mod reconciliation;
mod runner;
