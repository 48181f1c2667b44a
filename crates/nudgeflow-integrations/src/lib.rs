pub mod http;
pub mod mirror;
pub mod sequence;
pub mod telemetry;

pub use http::ServiceClient;
pub use mirror::HttpSessionMirror;
pub use sequence::HttpSequenceClient;
pub use telemetry::HttpTelemetrySink;
