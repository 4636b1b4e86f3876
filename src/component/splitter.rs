use super::body::SplitterBody;
use super::runner::{Exit, Frame, ItemFailure, LoopResult, Selected, receive_one};
use crate::checkpoint::SafePoint;
use crate::error::BodyError;
use crate::port::{Delivery, OutputPort};
use std::collections::BTreeSet;
use tokio::time::Instant;

/// Sends each item to the outputs the body routes it to. Every target is
/// awaited independently, so one full output does not hold back the others.
pub(super) async fn run(body: &mut dyn SplitterBody, frame: &mut Frame) -> LoopResult {
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
        let routed = body
          .route(&value, &mut frame.ctx)
          .await
          .and_then(|names| targets(&frame.data, names));
        match routed {
          Ok(targets) => frame.broadcast(&targets, &value).await?,
          Err(e) => {
            frame
              .fail(ItemFailure::body(e, Some(&port), Some(seq), value))
              .await?
          }
        }
        frame.metrics.record_latency(started.elapsed());
      }
    }
  }
}

fn targets(outputs: &[OutputPort], names: Vec<String>) -> Result<Vec<&OutputPort>, BodyError> {
  let mut seen = BTreeSet::new();
  let mut targets = Vec::with_capacity(names.len());
  for name in names {
    if !seen.insert(name.clone()) {
      continue;
    }
    let port = outputs
      .iter()
      .find(|port| port.name() == name)
      .ok_or_else(|| BodyError::runtime(format!("route names unknown output '{name}'")))?;
    targets.push(port);
  }
  Ok(targets)
}
