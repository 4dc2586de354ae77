pub mod anomaly_queries;
pub mod hours_usage_queries;
pub mod sensor_data_queries;
pub mod token_queries;
