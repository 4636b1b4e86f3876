use super::body::SourceBody;
use super::runner::{Exit, Frame, ItemFailure, LoopResult};
use crate::checkpoint::SafePoint;
use crate::port::OutputPort;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

/// Produces until the body is exhausted. Each value goes to every data
/// output.
pub(super) async fn run(body: &mut dyn SourceBody, frame: &mut Frame) -> LoopResult {
  loop {
    let deposit = frame.deposit(&*body);
    if frame.participant.safe_point(deposit).await == SafePoint::Stop {
      return Ok(Exit::Cancelled);
    }
    if frame.data.iter().all(OutputPort::is_closed) {
      warn!(component = %frame.name, "every output is closed, stopping source");
      return Ok(Exit::Completed);
    }

    let started = Instant::now();
    match body.produce(&mut frame.ctx).await {
      Ok(Some(value)) => {
        let targets: Vec<&OutputPort> = frame.data.iter().collect();
        frame.broadcast(&targets, &value).await?;
      }
      Ok(None) => return Ok(Exit::Completed),
      Err(e) => frame.fail(ItemFailure::body(e, None, None, Value::Null)).await?,
    }
    frame.metrics.record_latency(started.elapsed());
  }
}
