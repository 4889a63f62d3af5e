//! Services - pipeline stages and their state
//!
//! - `scanner` - per-scanner location state, debounce and sequencing
//! - `rules` - compiled routing rules
//! - `dispatcher` - per-sink retry, circuit breaking and fan-out
//! - `consumer` - persist, acknowledge and dispatch inbound events
//! - `maintenance` - retention pruning and daily reports

pub mod consumer;
pub mod dispatcher;
pub mod maintenance;
pub mod rules;
pub mod scanner;

pub use consumer::Consumer;
pub use dispatcher::Dispatcher;
pub use maintenance::Maintenance;
pub use rules::RuleEngine;
pub use scanner::ScannerSession;
