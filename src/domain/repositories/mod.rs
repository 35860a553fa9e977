pub mod exchange_client;
pub mod ledger_store;
pub mod signal_source;
