use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const PIPELINES_INFLIGHT: MetricDef = MetricDef {
    name: "pipeline.inflight",
    metric_type: MetricType::Gauge,
    description: "Provision and send pipelines holding an admission permit",
};

pub const SEND_LATENCY: MetricDef = MetricDef {
    name: "send.latency",
    metric_type: MetricType::Histogram,
    description: "Wall-clock time of a successful dispatch in milliseconds",
};

pub const SEND_ATTEMPTS: MetricDef = MetricDef {
    name: "send.attempts",
    metric_type: MetricType::Counter,
    description: "Dispatch attempts. Tagged with result (ok, error).",
};

pub const DELIVERY_EXHAUSTED: MetricDef = MetricDef {
    name: "send.delivery_exhausted",
    metric_type: MetricType::Counter,
    description: "Messages dropped after every attempt failed",
};

pub const CONNECTION_CACHE_HIT: MetricDef = MetricDef {
    name: "connection_cache.hit",
    metric_type: MetricType::Counter,
    description: "Sends that reused a cached device connection",
};

pub const CONNECTION_CACHE_MISS: MetricDef = MetricDef {
    name: "connection_cache.miss",
    metric_type: MetricType::Counter,
    description: "Sends that had to construct a device connection",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    PIPELINES_INFLIGHT,
    SEND_LATENCY,
    SEND_ATTEMPTS,
    DELIVERY_EXHAUSTED,
    CONNECTION_CACHE_HIT,
    CONNECTION_CACHE_MISS,
];
