//! Bundled prediction routines
//!
//! Small routines for trying the server out without a model: squaring a
//! number (per item, vectorized, or as a stream of partial results) and a
//! chat routine that always gives the same answer.

use anyhow::anyhow;
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::RoutineKind;
use batchloop_worker::{
    Backend, Codec, PassthroughCodec, PredictResult, Predictor, PredictorFactory, StepStream,
    StreamingPredictor,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Reply of the fixed-reply chat routine
pub const FIXED_REPLY: &str = "This is a generated output";

/// Number of emissions per input of the streaming square routine
pub const STREAM_STEPS: usize = 10;

fn number(input: &Value) -> PredictResult<f64> {
    input
        .as_f64()
        .ok_or_else(|| anyhow!("expected a number, got {}", input))
}

/// `{"input": <number>}` in, `{"output": <number>}` out
#[derive(Debug, Clone, Copy, Default)]
pub struct SquareCodec;

impl Codec for SquareCodec {
    fn decode_request(&self, request: Value) -> Result<Value> {
        match request.get("input") {
            Some(input) if input.is_number() => Ok(input.clone()),
            Some(other) => Err(BatchLoopError::malformed_input(format!(
                "`input` must be a number, got {}",
                other
            ))),
            None => Err(BatchLoopError::malformed_input("missing field `input`")),
        }
    }

    fn encode_response(&self, output: Value) -> Result<Value> {
        Ok(json!({ "output": output }))
    }
}

/// x² one input at a time
#[derive(Debug, Default)]
pub struct Square;

impl Predictor for Square {
    fn predict(&mut self, input: Value) -> PredictResult<Value> {
        let x = number(&input)?;
        Ok(json!(x * x))
    }
}

/// x² over a whole batch at once
#[derive(Debug, Default)]
pub struct BatchedSquare;

impl Predictor for BatchedSquare {
    fn predict(&mut self, input: Value) -> PredictResult<Value> {
        Ok(self.predict_batch(vec![input])?.remove(0))
    }

    fn predict_batch(&mut self, inputs: Vec<Value>) -> PredictResult<Vec<Value>> {
        let xs = inputs.iter().map(number).collect::<PredictResult<Vec<_>>>()?;
        debug!(batch_size = xs.len(), "Squaring batch");
        Ok(xs.into_iter().map(|x| json!(x * x)).collect())
    }
}

/// Streams x² in [`STREAM_STEPS`] progressive emissions, the last one exact
#[derive(Debug, Default)]
pub struct StreamingSquare;

impl StreamingPredictor for StreamingSquare {
    fn predict_stream<'a>(
        &'a mut self,
        inputs: Vec<Value>,
    ) -> PredictResult<Box<dyn StepStream + 'a>> {
        let squares = inputs
            .iter()
            .map(|input| number(input).map(|x| x * x))
            .collect::<PredictResult<Vec<_>>>()?;

        let steps = (1..=STREAM_STEPS).map(move |step| -> PredictResult<Vec<Option<Value>>> {
            let fraction = step as f64 / STREAM_STEPS as f64;
            Ok(squares
                .iter()
                .map(|square| Some(json!(square * fraction)))
                .collect())
        });

        Ok(Box::new(steps))
    }
}

/// Chat routine answering every conversation with [`FIXED_REPLY`]
#[derive(Debug, Default)]
pub struct FixedReply;

impl Predictor for FixedReply {
    fn predict(&mut self, input: Value) -> PredictResult<Value> {
        if !input.is_object() {
            return Err(anyhow!("expected a chat request"));
        }
        Ok(json!({ "role": "assistant", "content": FIXED_REPLY }))
    }
}

fn blocking<P: Predictor + Default + 'static>() -> PredictorFactory {
    Arc::new(|_: usize| Backend::blocking(P::default()))
}

fn streaming<P: StreamingPredictor + Default + 'static>() -> PredictorFactory {
    Arc::new(|_: usize| Backend::streaming(P::default()))
}

/// Factory and codec for a bundled routine
pub fn build(kind: RoutineKind) -> (PredictorFactory, Arc<dyn Codec>) {
    let codec: Arc<dyn Codec> = match kind {
        RoutineKind::FixedReply => Arc::new(PassthroughCodec),
        _ => Arc::new(SquareCodec),
    };

    let factory = match kind {
        RoutineKind::Square => blocking::<Square>(),
        RoutineKind::BatchedSquare => blocking::<BatchedSquare>(),
        RoutineKind::StreamingSquare => streaming::<StreamingSquare>(),
        RoutineKind::FixedReply => blocking::<FixedReply>(),
    };

    (factory, codec)
}
