//! Cancellation handles for running subscriptions.
//!
//! Every subscription owns one [`ControlChain`]: an arena of control nodes,
//! each storing the index of its parent. Slot 0 is the subscription anchor
//! handed back by `Stream::subscribe_for_controllable`. Source nodes attach
//! parentless nodes, scheduling boundaries attach children of the node they
//! receive from upstream.
//!
//! Cancelling any node raises the flag held for slot 0, which every node
//! (and every source polling between emissions) reads, then runs the cancel
//! hooks registered by scheduling boundaries so their pending work is
//! withdrawn.
//!
//! Short-lived nested subscriptions (the inner streams of `flat_map`) get a
//! scope: a chain of their own, registered weakly with the chain that opened
//! it. A scope's nodes are freed together with the scope, so the outer arena
//! does not grow with every inner subscription. Cancelling anywhere cancels
//! the outermost chain and every live scope below it.

use std::{
  collections::HashMap,
  fmt::{Debug, Formatter},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
  },
};

use parking_lot::Mutex;
use smallvec::SmallVec;

type CancelHook = Box<dyn FnOnce(&Controllable) + Send>;

pub(crate) struct ControlChain {
  cancel_requested: AtomicBool,
  cancel_completed: AtomicBool,
  nodes: Mutex<SmallVec<[ControlNode; 4]>>,
  outer: Option<(Arc<ControlChain>, u64)>,
  scopes: Mutex<HashMap<u64, Weak<ControlChain>>>,
  next_scope: AtomicU64,
}

struct ControlNode {
  parent: Option<usize>,
  hooks: SmallVec<[CancelHook; 1]>,
}

impl ControlNode {
  fn new(parent: Option<usize>) -> Self { ControlNode { parent, hooks: SmallVec::new() } }
}

impl ControlChain {
  /// Create the arena for a new subscription together with its anchor.
  pub(crate) fn new() -> (Arc<Self>, Controllable) {
    let mut nodes = SmallVec::new();
    nodes.push(ControlNode::new(None));
    let chain = Arc::new(Self::with_nodes(nodes, None, false));
    let anchor = Controllable { chain: chain.clone(), index: 0 };
    (chain, anchor)
  }

  fn with_nodes(nodes: SmallVec<[ControlNode; 4]>, outer: Option<(Arc<ControlChain>, u64)>, cancelled: bool) -> Self {
    ControlChain {
      cancel_requested: AtomicBool::new(cancelled),
      cancel_completed: AtomicBool::new(false),
      nodes: Mutex::new(nodes),
      outer,
      scopes: Mutex::new(HashMap::new()),
      next_scope: AtomicU64::new(0),
    }
  }

  /// Open a nested chain for an inner subscription. It starts cancelled if
  /// this chain already is, and unregisters itself when dropped.
  pub(crate) fn scope(self: &Arc<Self>) -> Arc<ControlChain> {
    let key = self.next_scope.fetch_add(1, Ordering::Relaxed);
    let mut scopes = self.scopes.lock();
    let cancelled = self.cancel_requested.load(Ordering::Acquire);
    let scope = Arc::new(Self::with_nodes(SmallVec::new(), Some((self.clone(), key)), cancelled));
    scopes.insert(key, Arc::downgrade(&scope));
    scope
  }

  /// The chain every scope below it was opened from.
  fn outermost(self: &Arc<Self>) -> Arc<ControlChain> {
    let mut chain = self.clone();
    while let Some(outer) = chain.outer.as_ref().map(|(outer, _)| outer.clone()) {
      chain = outer;
    }
    chain
  }

  /// Raise the flag, then run this chain's hooks and cancel its live scopes.
  fn cancel_tree(self: &Arc<Self>) {
    let hooks = {
      let mut nodes = self.nodes.lock();
      self.cancel_requested.store(true, Ordering::Release);
      let mut hooks = Vec::new();
      for (idx, node) in nodes.iter_mut().enumerate() {
        hooks.extend(node.hooks.drain(..).map(|hook| (idx, hook)));
      }
      hooks
    };
    let scopes: Vec<Arc<ControlChain>> = {
      let scopes = self.scopes.lock();
      scopes.values().filter_map(Weak::upgrade).collect()
    };

    if !hooks.is_empty() {
      tracing::trace!(hooks = hooks.len(), scopes = scopes.len(), "running cancel hooks");
    }
    for (index, hook) in hooks {
      hook(&Controllable { chain: self.clone(), index });
    }
    for scope in scopes {
      scope.cancel_tree();
    }
  }

  #[cfg(test)]
  pub(crate) fn node_count(&self) -> usize { self.nodes.lock().len() }

  #[cfg(test)]
  pub(crate) fn scope_count(&self) -> usize { self.scopes.lock().len() }

  fn attach(self: &Arc<Self>, parent: Option<usize>) -> Controllable {
    let mut nodes = self.nodes.lock();
    let index = nodes.len();
    nodes.push(ControlNode::new(parent));
    Controllable { chain: self.clone(), index }
  }

  /// A parentless node for a source stage.
  pub(crate) fn source(self: &Arc<Self>) -> Controllable { self.attach(None) }

  /// A node whose parent is filled in later, see [`Controllable::link_parent`].
  pub(crate) fn detached(self: &Arc<Self>) -> Controllable { self.attach(None) }
}

impl Drop for ControlChain {
  fn drop(&mut self) {
    if let Some((outer, key)) = &self.outer {
      outer.scopes.lock().remove(key);
    }
  }
}

/// Handle to one stage of a running subscription.
///
/// Cheap to clone; all clones address the same node. A sink receives its
/// handle through `on_subscribe` and may call [`Controllable::cancel`] at any
/// time from any thread.
#[derive(Clone)]
pub struct Controllable {
  chain: Arc<ControlChain>,
  index: usize,
}

impl Controllable {
  /// Request cancellation of the whole subscription.
  ///
  /// Idempotent. Sources observe the request at their next emission
  /// boundary; work still queued on a scheduler is withdrawn on a best-effort
  /// basis. `on_final` is still delivered exactly once.
  pub fn cancel(&self) { self.chain.outermost().cancel_tree(); }

  /// Whether cancellation has been requested anywhere in the subscription.
  pub fn is_cancel_requested(&self) -> bool { self.chain.cancel_requested.load(Ordering::Acquire) }

  /// Whether the producer has observed the request and stopped emitting.
  pub fn is_cancel_completed(&self) -> bool { self.chain.cancel_completed.load(Ordering::Acquire) }

  /// The next handle upstream, if this stage has one.
  pub fn parent(&self) -> Option<Controllable> {
    let parent = self.chain.nodes.lock()[self.index].parent;
    parent.map(|index| Controllable { chain: self.chain.clone(), index })
  }

  /// Whether this handle has no parent (a source or the subscription anchor).
  pub fn is_root(&self) -> bool { self.chain.nodes.lock()[self.index].parent.is_none() }

  /// Walk the parent links up to the top-most handle.
  pub fn root(&self) -> Controllable {
    let nodes = self.chain.nodes.lock();
    let mut index = self.index;
    while let Some(parent) = nodes[index].parent {
      index = parent;
    }
    Controllable { chain: self.chain.clone(), index }
  }

  /// Cancel the subscription as soon as the returned guard is dropped.
  ///
  /// **Attention:** binding the guard to `_` drops it immediately.
  pub fn cancel_on_drop(self) -> CancelGuard { CancelGuard { controllable: self, armed: true } }

  /// Attach a child node below this one, used by scheduling boundaries.
  pub(crate) fn child(&self) -> Controllable { self.chain.attach(Some(self.index)) }

  /// Point a detached node at the handle its upstream produced.
  pub(crate) fn link_parent(&self, parent: &Controllable) {
    if !Arc::ptr_eq(&self.chain, &parent.chain) || parent.index == self.index {
      return;
    }
    self.chain.nodes.lock()[self.index].parent = Some(parent.index);
  }

  /// Register work to run when the subscription is cancelled. Runs
  /// immediately if cancellation already happened.
  pub(crate) fn on_cancel(&self, hook: impl FnOnce(&Controllable) + Send + 'static) {
    {
      let mut nodes = self.chain.nodes.lock();
      if !self.is_cancel_requested() {
        nodes[self.index].hooks.push(Box::new(hook));
        return;
      }
    }
    hook(self);
  }

  /// Record that the producer stopped because of a cancellation request.
  pub(crate) fn mark_cancel_completed(&self) {
    if self.is_cancel_requested() {
      self.chain.cancel_completed.store(true, Ordering::Release);
    }
  }
}

impl Debug for Controllable {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Controllable")
      .field("index", &self.index)
      .field("cancel_requested", &self.is_cancel_requested())
      .field("cancel_completed", &self.is_cancel_completed())
      .finish()
  }
}

/// Cancels its subscription when dropped.
#[derive(Debug)]
#[must_use]
pub struct CancelGuard {
  controllable: Controllable,
  armed: bool,
}

impl CancelGuard {
  /// Give the handle back without cancelling.
  pub fn into_inner(mut self) -> Controllable {
    self.armed = false;
    self.controllable.clone()
  }
}

impl Drop for CancelGuard {
  fn drop(&mut self) {
    if self.armed {
      self.controllable.cancel();
    }
  }
}
