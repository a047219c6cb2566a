//! Background connector
//!
//! One task per connection owns the address set. It keeps one dial loop per
//! resolved address, folds their transitions into a [`PickerState`], and
//! re-resolves the target periodically. Dial loops dial with the
//! connection's backoff, publish a [`Subchannel`] once connected and redial
//! as soon as the balancer marks it broken.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, OptionFuture};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

use super::balancer::{ConnectivityState, PickerState, Subchannel};
use super::config::DialPlan;
use super::resolver::Resolver;

/// How often the target is looked up again while resolution succeeds
pub const RESOLVE_INTERVAL: Duration = Duration::from_secs(30);

/// Aborts the connector task (and with it every dial loop) when dropped
#[derive(Debug)]
pub(crate) struct ConnectorGuard {
  task: Option<AbortHandle>,
}

impl ConnectorGuard {
  pub(crate) fn abort(&self) {
    if let Some(task) = &self.task {
      task.abort();
    }
  }

  #[cfg(test)]
  pub(crate) fn detached() -> Self {
    Self { task: None }
  }
}

impl Drop for ConnectorGuard {
  fn drop(&mut self) {
    self.abort();
  }
}

#[derive(Debug, Clone)]
enum SubchannelStatus {
  Connecting,
  Ready(Subchannel),
  TransientFailure,
}

#[derive(Debug)]
struct SubchannelEvent {
  addr: SocketAddr,
  generation: u64,
  status: SubchannelStatus,
}

struct SubchannelEntry {
  generation: u64,
  status: SubchannelStatus,
  task: AbortHandle,
}

pub(crate) struct Connector {
  plan: Arc<DialPlan>,
  resolver: Arc<dyn Resolver>,
  publisher: Arc<watch::Sender<Arc<PickerState>>>,
  subchannels: HashMap<SocketAddr, SubchannelEntry>,
  tasks: JoinSet<()>,
  events_tx: mpsc::UnboundedSender<SubchannelEvent>,
  events_rx: mpsc::UnboundedReceiver<SubchannelEvent>,
  generation: u64,
  last_state: ConnectivityState,
}

impl Connector {
  /// Spawn the connector for an initial, non-empty address set
  pub(crate) fn spawn(
    plan: Arc<DialPlan>,
    resolver: Arc<dyn Resolver>,
    publisher: Arc<watch::Sender<Arc<PickerState>>>,
    addrs: Vec<SocketAddr>,
  ) -> ConnectorGuard {
    let connector = Self::new(plan, resolver, publisher);
    let task = tokio::spawn(connector.run(addrs));
    ConnectorGuard {
      task: Some(task.abort_handle()),
    }
  }

  fn new(
    plan: Arc<DialPlan>,
    resolver: Arc<dyn Resolver>,
    publisher: Arc<watch::Sender<Arc<PickerState>>>,
  ) -> Self {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    Self {
      plan,
      resolver,
      publisher,
      subchannels: HashMap::new(),
      tasks: JoinSet::new(),
      events_tx,
      events_rx,
      generation: 0,
      last_state: ConnectivityState::Connecting,
    }
  }

  async fn run(mut self, addrs: Vec<SocketAddr>) {
    self.update_addresses(addrs);

    let resolve_timer = tokio::time::sleep(RESOLVE_INTERVAL);
    tokio::pin!(resolve_timer);
    let mut resolve_failures: u32 = 0;
    // Polled alongside subchannel events so a slow lookup never holds them up
    let mut lookup: Option<BoxFuture<'static, io::Result<Vec<SocketAddr>>>> = None;

    loop {
      tokio::select! {
        Some(event) = self.events_rx.recv() => self.apply(event),
        () = &mut resolve_timer, if lookup.is_none() => {
          let resolver = self.resolver.clone();
          let plan = self.plan.clone();
          lookup = Some(Box::pin(async move { resolver.resolve(&plan.target).await }));
        }
        Some(result) = OptionFuture::from(lookup.as_mut()), if lookup.is_some() => {
          lookup = None;
          let next = match result {
            Ok(addrs) if !addrs.is_empty() => {
              resolve_failures = 0;
              self.update_addresses(addrs);
              RESOLVE_INTERVAL
            }
            result => {
              let delay = self.plan.backoff.jittered_delay(resolve_failures);
              resolve_failures = resolve_failures.saturating_add(1);
              tracing::warn!(
                target: "grpc_client",
                target_name = %self.plan.target.target,
                error = ?result.err(),
                retry_in = ?delay,
                "Re-resolution failed, keeping current addresses"
              );
              delay
            }
          };
          resolve_timer.set(tokio::time::sleep(next));
        }
        Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
          if let Err(error) = joined {
            if error.is_panic() {
              tracing::error!(target: "grpc_client", error = %error, "Subchannel task panicked");
            }
          }
        }
      }
    }
  }

  /// Diff the address set: dial new addresses, tear down vanished ones
  fn update_addresses(&mut self, addrs: Vec<SocketAddr>) {
    let removed: Vec<SocketAddr> = self
      .subchannels
      .keys()
      .filter(|addr| !addrs.contains(addr))
      .copied()
      .collect();

    for addr in removed {
      if let Some(entry) = self.subchannels.remove(&addr) {
        entry.task.abort();
        tracing::info!(target: "grpc_client", addr = %addr, "Address removed, closing subchannel");
      }
    }

    for addr in addrs {
      if self.subchannels.contains_key(&addr) {
        continue;
      }
      self.generation += 1;
      let generation = self.generation;
      let task = self.tasks.spawn(run_subchannel(
        addr,
        generation,
        self.plan.clone(),
        self.events_tx.clone(),
      ));
      self.subchannels.insert(
        addr,
        SubchannelEntry {
          generation,
          status: SubchannelStatus::Connecting,
          task,
        },
      );
      tracing::debug!(target: "grpc_client", addr = %addr, "Address added, dialing subchannel");
    }

    self.publish();
  }

  fn apply(&mut self, event: SubchannelEvent) {
    match self.subchannels.get_mut(&event.addr) {
      // Events from a torn down dial loop are stale
      Some(entry) if entry.generation == event.generation => entry.status = event.status,
      _ => return,
    }
    self.publish();
  }

  fn publish(&mut self) {
    let mut ready = Vec::new();
    let mut connecting = false;

    for entry in self.subchannels.values() {
      match &entry.status {
        SubchannelStatus::Ready(subchannel) => ready.push(subchannel.clone()),
        SubchannelStatus::Connecting => connecting = true,
        SubchannelStatus::TransientFailure => {}
      }
    }
    ready.sort_by_key(|subchannel| subchannel.addr);

    let state = aggregate(!ready.is_empty(), connecting);
    if state != self.last_state {
      tracing::info!(
        target: "grpc_client",
        target_name = %self.plan.target.target,
        from = ?self.last_state,
        to = ?state,
        ready = ready.len(),
        "Connectivity state changed"
      );
      self.last_state = state;
    }

    let next = Arc::new(PickerState { state, ready });
    // Shutdown is terminal, a late publish from an aborting task must not undo it
    self.publisher.send_if_modified(|current| {
      if current.state == ConnectivityState::Shutdown {
        return false;
      }
      *current = next;
      true
    });
  }
}

fn aggregate(any_ready: bool, any_connecting: bool) -> ConnectivityState {
  if any_ready {
    ConnectivityState::Ready
  } else if any_connecting {
    ConnectivityState::Connecting
  } else {
    ConnectivityState::TransientFailure
  }
}

/// Dial loop for one address
async fn run_subchannel(
  addr: SocketAddr,
  generation: u64,
  plan: Arc<DialPlan>,
  events: mpsc::UnboundedSender<SubchannelEvent>,
) {
  let send = |status| {
    let _ = events.send(SubchannelEvent {
      addr,
      generation,
      status,
    });
  };
  let mut retries: u32 = 0;

  loop {
    send(SubchannelStatus::Connecting);

    let endpoint = match plan.endpoint_for(addr) {
      Ok(endpoint) => endpoint,
      Err(error) => {
        tracing::error!(target: "grpc_client", addr = %addr, error = %error, "Invalid endpoint");
        send(SubchannelStatus::TransientFailure);
        return;
      }
    };

    let attempt_timeout = plan.connect_timeout(retries);
    match tokio::time::timeout(attempt_timeout, endpoint.connect()).await {
      Ok(Ok(channel)) => {
        tracing::debug!(target: "grpc_client", addr = %addr, "Subchannel ready");
        retries = 0;

        let broken = Arc::new(Notify::new());
        send(SubchannelStatus::Ready(Subchannel {
          addr,
          channel,
          broken: broken.clone(),
        }));

        broken.notified().await;
        tracing::debug!(target: "grpc_client", addr = %addr, "Subchannel broken, redialing");
        continue;
      }
      Ok(Err(error)) => {
        tracing::debug!(
          target: "grpc_client",
          addr = %addr,
          error = ?error,
          "Failed to connect subchannel"
        );
      }
      Err(_) => {
        tracing::debug!(
          target: "grpc_client",
          addr = %addr,
          timeout = ?attempt_timeout,
          "Subchannel connect attempt timed out"
        );
      }
    }

    send(SubchannelStatus::TransientFailure);
    let delay = plan.backoff.jittered_delay(retries);
    retries = retries.saturating_add(1);
    tokio::time::sleep(delay).await;
  }
}
