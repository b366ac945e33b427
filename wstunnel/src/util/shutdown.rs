// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Asynchronous shutdown lifecycle shared by every long-lived component.
//!
//! A component moves through the phases *unactivated → active →
//! shutdown-scheduled → shutting-down → shutdown-complete*. Shutdown may be
//! scheduled at any time with an advisory cause; the first non-`None` cause
//! wins. While a pause guard is held, a scheduled shutdown is remembered but
//! not started, allowing atomic activation sequences to complete first.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::cancellation::CancellationListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
  Unactivated,
  Active,
  ShutdownScheduled,
  ShuttingDown,
  Complete,
}

struct State<E> {
  phase: Phase,
  pause_count: usize,
  advisory_cause: Option<E>,
  final_cause: Option<E>,
}

struct Inner<E> {
  state: Mutex<State<E>>,
  started: CancellationToken,
  done_tx: watch::Sender<bool>,
  done_rx: watch::Receiver<bool>,
  children: Mutex<Vec<Box<dyn ChildShutdown>>>,
}

/// Handle to one component's shutdown state machine. Cloning shares state.
pub struct Shutdown<E> {
  inner: Arc<Inner<E>>,
}

impl<E> Clone for Shutdown<E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<E> std::fmt::Debug for Shutdown<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let phase = self.inner.state.lock().unwrap().phase;
    f.debug_struct("Shutdown").field("phase", &phase).finish()
  }
}

/// Object-safe view of a child component that the parent shuts down and
/// awaits after its own handler completes.
pub trait ChildShutdown: Send + Sync {
  fn start_shutdown(&self);
  fn wait_complete(&self) -> BoxFuture<'static, ()>;
}

impl<E: Clone + Send + Sync + 'static> ChildShutdown for Shutdown<E> {
  fn start_shutdown(&self) {
    self.start(None);
  }

  fn wait_complete(&self) -> BoxFuture<'static, ()> {
    let this = self.clone();
    Box::pin(async move {
      let _ = this.wait().await;
    })
  }
}

/// Guard produced by [Shutdown::pause]; shutdown scheduled while any guard is
/// alive begins only when the last guard drops.
pub struct PauseGuard<E: Clone + Send + Sync + 'static> {
  shutdown: Shutdown<E>,
}

impl<E: Clone + Send + Sync + 'static> Drop for PauseGuard<E> {
  fn drop(&mut self) {
    self.shutdown.resume();
  }
}

impl<E: Clone + Send + Sync + 'static> Default for Shutdown<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E: Clone + Send + Sync + 'static> Shutdown<E> {
  pub fn new() -> Self {
    let (done_tx, done_rx) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          phase: Phase::Unactivated,
          pause_count: 0,
          advisory_cause: None,
          final_cause: None,
        }),
        started: CancellationToken::new(),
        done_tx,
        done_rx,
        children: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn phase(&self) -> Phase {
    self.inner.state.lock().unwrap().phase
  }

  /// Marks the component active. Fails if shutdown has already begun; the
  /// advisory cause, if any, is returned as the reason.
  pub fn activate(&self) -> Result<(), Option<E>> {
    let mut state = self.inner.state.lock().unwrap();
    if state.phase >= Phase::ShuttingDown {
      return Err(state.advisory_cause.clone());
    }
    if state.phase == Phase::Unactivated {
      state.phase = Phase::Active;
    }
    Ok(())
  }

  /// Prevents a scheduled shutdown from beginning until the guard drops.
  /// Fails if shutdown has already begun.
  pub fn pause(&self) -> Result<PauseGuard<E>, Option<E>> {
    let mut state = self.inner.state.lock().unwrap();
    if state.phase >= Phase::ShuttingDown {
      return Err(state.advisory_cause.clone());
    }
    state.pause_count += 1;
    Ok(PauseGuard {
      shutdown: self.clone(),
    })
  }

  fn resume(&self) {
    let fire = {
      let mut state = self.inner.state.lock().unwrap();
      assert!(state.pause_count > 0, "resume without matching pause");
      state.pause_count -= 1;
      if state.pause_count == 0 && state.phase == Phase::ShutdownScheduled {
        state.phase = Phase::ShuttingDown;
        true
      } else {
        false
      }
    };
    if fire {
      self.inner.started.cancel();
    }
  }

  /// Schedules shutdown with an advisory completion cause. Idempotent; the
  /// first non-`None` cause is retained.
  pub fn start(&self, cause: Option<E>) {
    let fire = {
      let mut state = self.inner.state.lock().unwrap();
      if state.phase >= Phase::ShutdownScheduled {
        if state.advisory_cause.is_none() {
          state.advisory_cause = cause;
        }
        return;
      }
      if state.advisory_cause.is_none() {
        state.advisory_cause = cause;
      }
      if state.pause_count == 0 {
        state.phase = Phase::ShuttingDown;
        true
      } else {
        state.phase = Phase::ShutdownScheduled;
        false
      }
    };
    if fire {
      self.inner.started.cancel();
    }
  }

  pub fn is_scheduled(&self) -> bool {
    self.phase() >= Phase::ShutdownScheduled
  }

  pub fn is_started(&self) -> bool {
    self.phase() >= Phase::ShuttingDown
  }

  pub fn is_complete(&self) -> bool {
    self.phase() == Phase::Complete
  }

  /// Signal observable by workers; fires when shutdown actually begins.
  pub fn started(&self) -> CancellationListener {
    CancellationListener::from(&self.inner.started)
  }

  /// The advisory cause recorded so far, if any.
  pub fn advisory_cause(&self) -> Option<E> {
    self.inner.state.lock().unwrap().advisory_cause.clone()
  }

  /// Registers a child whose shutdown will be started and awaited by
  /// [Shutdown::complete] before this component reports completion.
  pub fn add_child<C: ChildShutdown + 'static>(&self, child: C) {
    self.inner.children.lock().unwrap().push(Box::new(child));
  }

  /// Finishes shutdown: starts and awaits all registered children, then
  /// publishes the final cause. `final_cause` of `None` falls back to the
  /// advisory cause. Idempotent after the first call.
  pub async fn complete(&self, final_cause: Option<E>) {
    // Completion implies the started signal even if start() was never called.
    self.start(None);
    let children = {
      let mut children = self.inner.children.lock().unwrap();
      std::mem::take(&mut *children)
    };
    for child in &children {
      child.start_shutdown();
    }
    for child in &children {
      child.wait_complete().await;
    }
    {
      let mut state = self.inner.state.lock().unwrap();
      if state.phase == Phase::Complete {
        return;
      }
      state.final_cause = final_cause.or_else(|| state.advisory_cause.clone());
      state.phase = Phase::Complete;
    }
    let _ = self.inner.done_tx.send(true);
  }

  /// Synchronous completion for leaf components with no registered
  /// children; usable from `Drop`. Children registered anyway are leaked
  /// un-awaited, so leaf components must not register any.
  pub fn complete_now(&self, final_cause: Option<E>) {
    self.start(None);
    {
      let mut state = self.inner.state.lock().unwrap();
      if state.phase == Phase::Complete {
        return;
      }
      state.final_cause = final_cause.or_else(|| state.advisory_cause.clone());
      state.phase = Phase::Complete;
    }
    let _ = self.inner.done_tx.send(true);
  }

  /// Blocks until shutdown is complete, returning the final cause. Does not
  /// itself initiate shutdown.
  pub async fn wait(&self) -> Option<E> {
    let mut done = self.inner.done_rx.clone();
    while !*done.borrow() {
      if done.changed().await.is_err() {
        break;
      }
    }
    self.inner.state.lock().unwrap().final_cause.clone()
  }

  /// The final cause, if shutdown has completed.
  pub fn result(&self) -> Option<Option<E>> {
    let state = self.inner.state.lock().unwrap();
    if state.phase == Phase::Complete {
      Some(state.final_cause.clone())
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn first_cause_wins_and_close_is_idempotent() {
    let s = Shutdown::<String>::new();
    s.activate().unwrap();
    s.start(Some("first".to_string()));
    s.start(Some("second".to_string()));
    s.complete(None).await;
    assert_eq!(s.wait().await, Some("first".to_string()));
    assert_eq!(s.wait().await, Some("first".to_string()));
    assert_eq!(s.result(), Some(Some("first".to_string())));
  }

  #[tokio::test]
  async fn pause_defers_started_signal() {
    let s = Shutdown::<String>::new();
    s.activate().unwrap();
    let guard = s.pause().unwrap();
    s.start(None);
    assert!(s.is_scheduled());
    assert!(!s.is_started());
    drop(guard);
    assert!(s.is_started());
    tokio::time::timeout(Duration::from_secs(1), s.started().cancelled())
      .await
      .expect("started signal must fire once the pause drains");
  }

  #[tokio::test]
  async fn pause_after_shutdown_started_fails() {
    let s = Shutdown::<String>::new();
    s.start(Some("gone".to_string()));
    assert!(s.pause().is_err());
    assert!(s.activate().is_err());
  }

  #[tokio::test]
  async fn children_complete_before_parent() {
    let parent = Shutdown::<String>::new();
    let child = Shutdown::<String>::new();
    parent.add_child(child.clone());
    {
      let child = child.clone();
      tokio::spawn(async move {
        child.started().cancelled().await;
        child.complete(Some("child cause".to_string())).await;
      });
    }
    parent.start(None);
    tokio::time::timeout(Duration::from_secs(1), parent.complete(None))
      .await
      .expect("parent completion must not deadlock on its child");
    assert!(child.is_complete());
    assert_eq!(parent.wait().await, None);
  }
}
