pub mod chunked;
pub mod date;
pub mod header;

pub use date::HttpDate;
pub use header::{
    format_response_head, parse_request, parse_response, Headers, Method, RemoteStatus, RequestHead,
    ResponseHead,
};
