//! The request body pump and the response body stream.

mod pump;
mod response_stream;

pub use pump::{BlockingRead, BodyPump, RequestBodySource};
pub use response_stream::ResponseBodyStream;
