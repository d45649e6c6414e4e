pub mod reconcile;
pub mod serve;
