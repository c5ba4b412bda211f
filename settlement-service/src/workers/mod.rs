pub mod reconciler;

pub use reconciler::ReconciliationWorker;
