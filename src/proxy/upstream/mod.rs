pub mod client;

pub use client::{
    connection_error_status, humanize_connection_error, RequestOptions, SseHandle,
    UpstreamByteStream, UpstreamClient, UpstreamResponse,
};
