mod body;
mod headers;
mod line;
mod request;
mod response;

pub use body::{BodyTooLarge, read_chunked_body, read_fixed_body, read_until_close};
pub use headers::{HeaderAccumulator, HeaderLine};
pub use line::read_line_with_timeout;
pub use request::{RequestHead, read_request_head};
pub use response::{CacheStatus, ResponseHead, encode_response, read_response_head};
