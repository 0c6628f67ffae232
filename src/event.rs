use std::time::Duration;
use tokio::sync::mpsc;

/// Events driving the CLI loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for query polling and refresh decisions
  Tick,
  /// Ctrl-C or an explicit request to stop
  Shutdown,
}

/// Event handler that produces events from a tick timer and ctrl-c
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let ticker = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      let ctrl_c = tokio::signal::ctrl_c();
      tokio::pin!(ctrl_c);
      loop {
        tokio::select! {
          _ = interval.tick() => {
            if ticker.send(Event::Tick).is_err() {
              break;
            }
          }
          _ = &mut ctrl_c => {
            let _ = ticker.send(Event::Shutdown);
            break;
          }
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for injecting events from other tasks
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
