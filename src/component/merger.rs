use super::body::MergerBody;
use super::runner::{Exit, Frame, ItemFailure, LoopResult, Selected, select_input};
use crate::checkpoint::SafePoint;
use crate::error::ComponentCrash;
use crate::port::Delivery;
use serde_json::Value;
use tokio::time::Instant;

/// Round-robin over the inputs; merged values go to the single output,
/// through the window buffer when one is attached.
pub(super) async fn run(body: &mut dyn MergerBody, frame: &mut Frame) -> LoopResult {
  loop {
    let deposit = frame.deposit(&*body);
    if frame.participant.safe_point(deposit).await == SafePoint::Stop {
      return Ok(Exit::Cancelled);
    }

    match select_input(&frame.inputs, &mut frame.cursor, &frame.participant).await {
      Selected::Interrupted => continue,
      Selected::Exhausted => break,
      Selected::Item { result: Err(e), .. } => frame.fail(ItemFailure::port(e)).await?,
      Selected::Item {
        index,
        result: Ok(Delivery { seq, value }),
      } => {
        let started = Instant::now();
        let port = frame.inputs[index].name().to_string();
        frame.ctx.set_delivery(&port, seq);
        match body.merge(&port, value.clone(), &mut frame.ctx).await {
          Ok(Some(merged)) => emit(frame, merged).await?,
          Ok(None) => {}
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

  match body.flush(&mut frame.ctx).await {
    Ok(Some(merged)) => emit(frame, merged).await?,
    Ok(None) => {}
    Err(e) => frame.fail(ItemFailure::body(e, None, None, Value::Null)).await?,
  }
  let partial = frame.window.as_mut().and_then(|window| window.drain());
  if let Some(window) = partial {
    send(frame, window).await?;
  }
  Ok(Exit::Completed)
}

async fn emit(frame: &mut Frame, value: Value) -> Result<(), ComponentCrash> {
  let ready = match frame.window.as_mut() {
    Some(window) => window.push(value),
    None => Some(value),
  };
  match ready {
    Some(value) => send(frame, value).await,
    None => Ok(()),
  }
}

async fn send(frame: &Frame, value: Value) -> Result<(), ComponentCrash> {
  if let Err(e) = frame.data[0].send(value).await {
    frame.fail(ItemFailure::port(e)).await?;
  }
  Ok(())
}
