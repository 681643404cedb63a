//! Queue-pair engine: completion queues, submission queues and the request
//! pool each submission queue owns.

pub mod completion;
pub mod request;
pub mod submission;

pub use completion::CompletionQueue;
pub use request::{Opaque, RequestContext, RequestPool};
pub use submission::SubmissionQueue;
