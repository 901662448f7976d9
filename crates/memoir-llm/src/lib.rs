pub mod api;
pub mod error;
pub mod gateway;
pub mod http;
pub mod stream;

pub use api::{InputMessage, ResponseBackend, ResponseOutput, ResponseRequest, Usage};
pub use error::LlmError;
pub use gateway::{CallOutcome, LlmGateway, StreamSummary};
pub use http::HttpBackend;
pub use stream::StreamEvent;
