pub mod metrics_server;
