use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref ACTIVE_STREAMS: Gauge = register_gauge!(
        "fabriq_active_streams",
        "Number of streams currently in the live state"
    )
    .unwrap();
    pub static ref ACTIVE_TRANSCODERS: Gauge = register_gauge!(
        "fabriq_active_transcoders",
        "Number of encoder processes currently supervised"
    )
    .unwrap();
    pub static ref TRANSCODER_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "fabriq_transcoder_cpu_usage_percent",
        "CPU usage of the encoder process for a stream (0-100+)",
        &["stream_id"]
    )
    .unwrap();
    pub static ref STREAM_VIEWER_COUNT: GaugeVec = register_gauge_vec!(
        "fabriq_stream_viewer_count",
        "Live viewer count per stream",
        &["tenant_id", "stream_id"]
    )
    .unwrap();
    pub static ref CHAT_MESSAGES_REJECTED: CounterVec = register_counter_vec!(
        "fabriq_chat_messages_rejected_total",
        "Chat messages rejected by the moderator, labeled by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref HLS_BYTES_SERVED: CounterVec = register_counter_vec!(
        "fabriq_hls_bytes_served_total",
        "Bytes served from the HLS origin, labeled by file kind",
        &["kind"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
