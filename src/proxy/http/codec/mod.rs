mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::trim_line_ending;
pub(crate) use line::{
    read_line_with_deadline, read_line_with_timeout, read_raw_line_with_deadline,
};
pub(crate) use request::{Http1RequestHead, read_http1_request_head};
pub(crate) use response::{
    ConnectionOverride, Http1ResponseHead, encode_http1_response_head, read_http1_response_head,
};
