//! Integration tests for composed pipelines.
//!
//! Covers the protocol guarantees across operator chains, scheduler
//! hand-offs and cancellation.

use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  thread,
  time::Duration,
};

use parking_lot::Mutex;
use rxchain::{
  prelude::*,
  testing::{Event, Recorder},
};

const WAIT: Duration = Duration::from_secs(5);

fn pool(prefix: &str, size: usize) -> PoolScheduler {
  PoolScheduler::new(PoolConfig { pool_size: Some(size), name_prefix: prefix.into() }).unwrap()
}

fn terminal_count<T>(events: &[Event<T>]) -> usize {
  events.iter().filter(|e| matches!(e, Event::Error(_) | Event::Complete)).count()
}

#[test]
fn map_doubles_then_completes() {
  let recorder = Recorder::new();
  Stream::from_iter(vec![1, 2, 3]).map(|x| x * 2).subscribe(recorder.clone());
  assert_eq!(
    recorder.events(),
    vec![Event::Subscribe, Event::Next(2), Event::Next(4), Event::Next(6), Event::Complete, Event::Final]
  );
}

#[test]
fn failing_mapper_stops_the_stream() {
  let recorder = Recorder::new();
  Stream::from_iter(vec![1, 2, 3])
    .try_map(|x| if x == 2 { Err(RxError::msg("mapper failed")) } else { Ok(x * 2) })
    .subscribe(recorder.clone());
  assert_eq!(
    recorder.events(),
    vec![Event::Subscribe, Event::Next(2), Event::Error("mapper failed".into()), Event::Final]
  );
}

#[test]
fn cancel_in_on_subscribe_emits_nothing() {
  let recorder = Recorder::new().cancel_on_subscribe();
  Stream::from_iter(vec![1, 2, 3, 4, 5]).map(|x| x + 1).subscribe(recorder.clone());
  assert_eq!(recorder.events(), vec![Event::Subscribe, Event::Final]);
  assert!(recorder.controllable().unwrap().is_cancel_completed());
}

#[test]
fn try_catch_recovers_a_failing_source() {
  let recorder = Recorder::new();
  Stream::<i32>::from_fn(|| -> Result<i32, RxError> { panic!("source exploded") })
    .try_catch()
    .subscribe(recorder.clone());
  assert_eq!(recorder.events(), vec![Event::Subscribe, Event::Next(None), Event::Final]);
}

#[test]
fn cancel_is_idempotent() {
  let host = HostScheduler::spawn("idempotent-cancel").unwrap();
  let recorder = Recorder::new();
  let control = Stream::from_iter(0..1000)
    .observe_on(host, Some(Duration::from_millis(20)), true)
    .subscribe_for_controllable(recorder.clone());
  control.cancel();
  control.cancel();
  assert!(recorder.wait_for_final(WAIT));
  control.cancel();

  thread::sleep(Duration::from_millis(50));
  assert_eq!(recorder.final_count(), 1);
  assert!(terminal_count(&recorder.events()) <= 1);
}

#[test]
fn serial_observe_on_preserves_order() {
  let recorder = Recorder::new();
  Stream::from_iter(vec![1, 2, 3, 4, 5]).observe_on(pool("order-", 4), None, true).subscribe(recorder.clone());
  assert!(recorder.wait_for_final(WAIT));
  assert_eq!(recorder.items(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn every_chain_finalizes_exactly_once() {
  let pool = pool("finalize-", 4);
  let host = HostScheduler::spawn("finalize-host").unwrap();

  let chains: Vec<Stream<i32>> = vec![
    Stream::from_iter(0..10).map(|v| v + 1),
    Stream::fail(RxError::msg("boom")).schedule_in(pool.clone(), None, false),
    Stream::from_iter(0..10).observe_on(host.clone(), None, true).filter(|v| v % 2 == 0),
    Stream::from_iter(0..5).delay(Duration::from_millis(5)),
    Stream::from_iter(0..5).flat_map({
      let pool = pool.clone();
      move |v| Stream::just(v).schedule_in(pool.clone(), None, false)
    }),
    Stream::from_iter(0..5)
      .publish_on(pool.clone(), |_| Ok::<_, RxError>(()), None, false)
      .observe_on(host.clone(), None, true),
    Stream::from_iter(0..5).try_map(|v| if v == 3 { Err("three") } else { Ok(v) }).delay(Duration::from_millis(1)),
  ];

  for chain in chains {
    let recorder = Recorder::new();
    chain.subscribe(recorder.clone());
    assert!(recorder.wait_for_final(WAIT));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(recorder.final_count(), 1);

    let events = recorder.events();
    assert_eq!(events.first(), Some(&Event::Subscribe));
    assert_eq!(events.last(), Some(&Event::Final));
    assert!(terminal_count(&events) <= 1);
  }
}

#[test]
fn cancelled_chains_finalize_exactly_once() {
  let pool = pool("cancelled-", 2);
  let host = HostScheduler::spawn("cancelled-host").unwrap();

  let chains: Vec<Stream<i32>> = vec![
    Stream::from_iter(0..100).schedule_in(pool.clone(), Some(Duration::from_millis(100)), true),
    Stream::from_iter(0..100).observe_on(host.clone(), Some(Duration::from_millis(100)), true),
    Stream::from_iter(0..100).delay(Duration::from_millis(100)),
    Stream::from_iter(0..100)
      .publish_on(pool.clone(), |_| Ok::<_, RxError>(()), Some(Duration::from_millis(100)), true),
  ];

  for chain in chains {
    let recorder = Recorder::new();
    let control = chain.subscribe_for_controllable(recorder.clone());
    control.cancel();
    assert!(recorder.wait_for_final(WAIT));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(recorder.final_count(), 1);
    assert!(recorder.items().is_empty());
  }
}

#[test]
fn cancel_from_downstream_reaches_a_remote_source() {
  let produced = Arc::new(AtomicUsize::new(0));
  let c_produced = produced.clone();
  let recorder = Recorder::new().cancel_after(3);
  Stream::<usize>::create(move |emitter| {
    for i in 0.. {
      c_produced.fetch_add(1, Ordering::SeqCst);
      if !emitter.next(i) {
        break;
      }
      thread::sleep(Duration::from_millis(1));
    }
    Ok::<_, RxError>(())
  })
  .schedule_in(pool("remote-", 1), None, false)
  .map(|v| v * 2)
  .subscribe(recorder.clone());

  assert!(recorder.wait_for_final(WAIT));
  assert_eq!(recorder.items(), vec![0, 2, 4]);
  assert!(produced.load(Ordering::SeqCst) <= 4);
  assert_eq!(recorder.events().last(), Some(&Event::Final));
}

#[test]
fn scheduler_hops_run_each_stage_where_asked() {
  let host = HostScheduler::spawn("hops-host").unwrap();
  let source_threads = Arc::new(Mutex::new(Vec::new()));
  let c_source_threads = source_threads.clone();

  let recorder = Recorder::new();
  Stream::from_iter(vec![1, 2, 3])
    .do_on_next(move |_| c_source_threads.lock().push(thread::current().name().map(str::to_owned)))
    .schedule_in(pool("hops-pool-", 2), None, false)
    .observe_on(host.clone(), None, true)
    .subscribe(recorder.clone());
  assert!(recorder.wait_for_final(WAIT));

  assert!(source_threads
    .lock()
    .iter()
    .all(|name| name.as_deref().map_or(false, |n| n.starts_with("hops-pool-"))));
  assert!(recorder.threads()[1..].iter().all(|t| *t == host.thread_id()));
}

#[test]
fn delayed_items_arrive_before_completion() {
  let recorder = Recorder::new();
  Stream::from_iter(vec![1, 2, 3])
    .flat_map(|v| Stream::just(v).delay(Duration::from_millis(10 * (4 - v as u64))))
    .subscribe(recorder.clone());
  assert!(recorder.wait_for_final(WAIT));

  let events = recorder.events();
  assert_eq!(&events[events.len() - 2..], &[Event::Complete, Event::Final]);
  let mut items = recorder.items();
  items.sort();
  assert_eq!(items, vec![1, 2, 3]);
}

#[test]
fn independent_subscriptions_do_not_share_state() {
  let counter = Arc::new(AtomicUsize::new(0));
  let c_counter = counter.clone();
  let stream = Stream::from_fn(move || Ok::<_, RxError>(c_counter.fetch_add(1, Ordering::SeqCst)));

  let first = Recorder::new();
  let second = Recorder::new().cancel_on_subscribe();
  stream.subscribe(first.clone());
  stream.subscribe(second.clone());

  assert_eq!(first.items(), vec![0]);
  assert!(second.items().is_empty());
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn guard_cancels_a_running_subscription_on_drop() {
  let host = HostScheduler::spawn("guard-host").unwrap();
  let recorder = Recorder::new();
  {
    let _guard = Stream::from_iter(0..100)
      .observe_on(host, Some(Duration::from_millis(100)), true)
      .subscribe_for_controllable(recorder.clone())
      .cancel_on_drop();
  }
  assert!(recorder.wait_for_final(WAIT));
  assert!(recorder.items().is_empty());
}

#[test]
fn default_schedulers_are_shared() {
  let first = rxchain::scheduler::background().unwrap();
  let second = rxchain::scheduler::background().unwrap();
  assert!(Arc::ptr_eq(&first, &second));

  let recorder = Recorder::new();
  Stream::just(1).observe_on(rxchain::scheduler::host().unwrap(), None, true).subscribe(recorder.clone());
  assert!(recorder.wait_for_final(WAIT));
  assert_eq!(recorder.items(), vec![1]);
}
