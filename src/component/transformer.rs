use super::body::TransformerBody;
use super::runner::{Exit, Frame, ItemFailure, LoopResult, Selected, receive_one};
use crate::checkpoint::SafePoint;
use crate::port::Delivery;
use tokio::time::Instant;

/// Strictly one output per input.
pub(super) async fn run(body: &mut dyn TransformerBody, frame: &mut Frame) -> LoopResult {
  loop {
    let deposit = frame.deposit(&*body);
    if frame.participant.safe_point(deposit).await == SafePoint::Stop {
      return Ok(Exit::Cancelled);
    }

    match receive_one(&frame.inputs[0], &frame.participant).await {
      Selected::Interrupted => continue,
      Selected::Exhausted => return Ok(Exit::Completed),
      Selected::Item { result: Err(e), .. } => frame.fail(ItemFailure::port(e)).await?,
      Selected::Item {
        result: Ok(Delivery { seq, value }),
        ..
      } => {
        let started = Instant::now();
        let port = frame.inputs[0].name().to_string();
        frame.ctx.set_delivery(&port, seq);
        match body.transform(value.clone(), &mut frame.ctx).await {
          Ok(output) => {
            if let Err(e) = frame.data[0].send(output).await {
              frame.fail(ItemFailure::port(e)).await?;
            }
          }
          Err(e) => {
            frame
              .fail(ItemFailure::body(e, Some(&port), Some(seq), value))
              .await?;
          }
        }
        frame.metrics.record_latency(started.elapsed());
      }
    }
  }
}
