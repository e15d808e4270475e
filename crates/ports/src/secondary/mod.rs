pub mod metrics_port;
pub mod packet_sink_port;
pub mod session_sync_port;
