pub mod mock_exchange;
pub mod rate_limited_client;
