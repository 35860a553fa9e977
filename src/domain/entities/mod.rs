pub mod balance;
pub mod market;
pub mod order;
pub mod position;
pub mod risk_state;
pub mod summary;
pub mod trade;
