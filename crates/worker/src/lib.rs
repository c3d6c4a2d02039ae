//! BatchLoop Worker
//!
//! The request batching and streaming core. Inbound requests become
//! envelopes, the scheduler groups them into batches under a size/time
//! policy, a pool of workers runs each batch through the user predict
//! routine, and every connection drains its own ordered output channel.

pub mod batching;
pub mod envelope;
pub mod predictor;
pub mod response;
pub mod worker;

pub use batching::{Batch, BatchScheduler};
pub use envelope::{RequestEnvelope, RequestId, ResponseMode, StreamEvent};
pub use predictor::{
    Backend, Codec, PassthroughCodec, PredictResult, Predictor, PredictorFactory, StepStream,
    StreamingPredictor,
};
pub use response::ResponseHandle;
pub use worker::{PredictionWorker, WorkerPool};
