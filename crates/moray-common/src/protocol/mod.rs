pub mod error;
pub mod message;
pub mod remote;

#[cfg(test)]
mod tests;

pub use error::{millis, ErrorLayer, MorayError, Result};
pub use message::{Message, MessageData, MessageStatus, MethodMeta, RequestId, MAX_REQUEST_ID};
pub use remote::{RemoteError, RemoteErrorKind};
