//! Prediction routines
//!
//! The user-supplied model is an opaque capability. Blocking routines turn
//! inputs into one output each; streaming routines hand back a pull-based
//! [`StepStream`] that the worker loop pumps until every batch member is done.
//! Which variant runs is decided once, when the [`Backend`] is built.

use batchloop_common::error::Result;
use serde_json::Value;
use std::sync::Arc;

/// Result type of user routines. Any error aborts the current batch only.
pub type PredictResult<T> = anyhow::Result<T>;

/// A routine producing exactly one output per input
pub trait Predictor: Send {
    /// Called once on the worker thread before the first batch
    fn setup(&mut self) -> PredictResult<()> {
        Ok(())
    }

    /// Predict a single input
    fn predict(&mut self, input: Value) -> PredictResult<Value>;

    /// Vectorized prediction; `outputs[i]` must correspond to `inputs[i]`
    fn predict_batch(&mut self, inputs: Vec<Value>) -> PredictResult<Vec<Value>> {
        inputs.into_iter().map(|input| self.predict(input)).collect()
    }
}

/// Pull-based emission contract of a streaming routine.
///
/// Each step returns one slot per batch member: `Some(chunk)` is delivered to
/// that member, `None` marks it complete. Returning `None` from `next_step`
/// completes every member still open.
pub trait StepStream {
    fn next_step(&mut self) -> Option<PredictResult<Vec<Option<Value>>>>;
}

impl<I> StepStream for I
where
    I: Iterator<Item = PredictResult<Vec<Option<Value>>>>,
{
    fn next_step(&mut self) -> Option<PredictResult<Vec<Option<Value>>>> {
        self.next()
    }
}

/// A routine producing a sequence of chunks per input
pub trait StreamingPredictor: Send {
    /// Called once on the worker thread before the first batch
    fn setup(&mut self) -> PredictResult<()> {
        Ok(())
    }

    /// Start streaming a batch of inputs
    fn predict_stream<'a>(
        &'a mut self,
        inputs: Vec<Value>,
    ) -> PredictResult<Box<dyn StepStream + 'a>>;
}

/// The routine variant a worker runs
pub enum Backend {
    Blocking(Box<dyn Predictor>),
    Streaming(Box<dyn StreamingPredictor>),
}

impl Backend {
    pub fn blocking<P: Predictor + 'static>(predictor: P) -> Self {
        Backend::Blocking(Box::new(predictor))
    }

    pub fn streaming<P: StreamingPredictor + 'static>(predictor: P) -> Self {
        Backend::Streaming(Box::new(predictor))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Backend::Streaming(_))
    }

    pub fn setup(&mut self) -> PredictResult<()> {
        match self {
            Backend::Blocking(predictor) => predictor.setup(),
            Backend::Streaming(predictor) => predictor.setup(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Blocking(_) => f.write_str("Backend::Blocking"),
            Backend::Streaming(_) => f.write_str("Backend::Streaming"),
        }
    }
}

/// Builds one backend per worker; the argument is the worker index
pub type PredictorFactory = Arc<dyn Fn(usize) -> Backend + Send + Sync>;

/// Translation between HTTP payloads and routine inputs/outputs.
///
/// Shared by every connection, so decoding happens before a request enters
/// the scheduler and encoding happens per chunk on the way out.
pub trait Codec: Send + Sync {
    /// Validate and unwrap a request body
    fn decode_request(&self, request: Value) -> Result<Value>;

    /// Wrap one routine output (or one streamed chunk) for the wire
    fn encode_response(&self, output: Value) -> Result<Value>;
}

/// Codec that hands payloads through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn decode_request(&self, request: Value) -> Result<Value> {
        Ok(request)
    }

    fn encode_response(&self, output: Value) -> Result<Value> {
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    impl Predictor for Doubler {
        fn predict(&mut self, input: Value) -> PredictResult<Value> {
            let x = input
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
            Ok(json!(x * 2.0))
        }
    }

    #[test]
    fn test_default_predict_batch_is_positional() {
        let mut predictor = Doubler;
        let outputs = predictor
            .predict_batch(vec![json!(1.0), json!(2.0), json!(3.0)])
            .unwrap();

        assert_eq!(outputs, vec![json!(2.0), json!(4.0), json!(6.0)]);
    }

    #[test]
    fn test_default_predict_batch_stops_on_error() {
        let mut predictor = Doubler;
        assert!(predictor
            .predict_batch(vec![json!(1.0), json!("x")])
            .is_err());
    }

    #[test]
    fn test_iterator_is_a_step_stream() {
        let steps: Vec<PredictResult<Vec<Option<Value>>>> = vec![Ok(vec![Some(json!(1)), None])];
        let mut stream: Box<dyn StepStream> = Box::new(steps.into_iter());

        let first = stream.next_step().unwrap().unwrap();
        assert_eq!(first, vec![Some(json!(1)), None]);
        assert!(stream.next_step().is_none());
    }

    #[test]
    fn test_backend_kind() {
        assert!(!Backend::blocking(Doubler).is_streaming());
    }
}
