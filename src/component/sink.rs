use super::body::SinkBody;
use super::runner::{Exit, Frame, ItemFailure, LoopResult, Selected, select_input};
use crate::checkpoint::SafePoint;
use crate::port::Delivery;
use tokio::time::Instant;

/// Consumes from every input, round-robin, until all of them end.
pub(super) async fn run(body: &mut dyn SinkBody, frame: &mut Frame) -> LoopResult {
  loop {
    let deposit = frame.deposit(&*body);
    if frame.participant.safe_point(deposit).await == SafePoint::Stop {
      return Ok(Exit::Cancelled);
    }

    match select_input(&frame.inputs, &mut frame.cursor, &frame.participant).await {
      Selected::Interrupted => continue,
      Selected::Exhausted => return Ok(Exit::Completed),
      Selected::Item { result: Err(e), .. } => frame.fail(ItemFailure::port(e)).await?,
      Selected::Item {
        index,
        result: Ok(Delivery { seq, value }),
      } => {
        let started = Instant::now();
        let port = frame.inputs[index].name().to_string();
        frame.ctx.set_delivery(&port, seq);
        if let Err(e) = body.consume(&port, value.clone(), &mut frame.ctx).await {
          frame
            .fail(ItemFailure::body(e, Some(&port), Some(seq), value))
            .await?;
        }
        frame.metrics.record_latency(started.elapsed());
      }
    }
  }
}
