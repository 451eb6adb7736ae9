mod common;

use common::RecordingControl;
use nix::unistd::Pid;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use xpd::{
    ConnectionId, Link, ProxyConfig, ProxyError, SessionPool, SweepOutcome, UnixLink,
};

fn pool_with(config: ProxyConfig) -> (SessionPool, Arc<RecordingControl>) {
    let control = Arc::new(RecordingControl::default());
    (SessionPool::new(config, control.clone()), control)
}

#[test]
fn test_opposite_moves_do_not_deadlock() {
    let (pool, _) = pool_with(ProxyConfig::default());
    let pool = Arc::new(pool);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    a.set_valid(true);
    b.set_valid(true);

    let rounds = 200;
    for i in 0..rounds {
        a.attach_client(ConnectionId::new(1), i as u16);
        b.attach_client(ConnectionId::new(2), i as u16);
    }

    let barrier = Arc::new(Barrier::new(2));
    let spawn_mover = |from: i16, to: i16| {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut moved = 0;
            for slot in 0..rounds {
                if pool.move_client(from, to, slot).is_ok() {
                    moved += 1;
                }
            }
            moved
        })
    };
    let forward = spawn_mover(0, 1);
    let backward = spawn_mover(1, 0);

    let moved = forward.join().unwrap() + backward.join().unwrap();
    assert!(moved > 0);
    assert_eq!(a.client_count() + b.client_count(), 2 * rounds);
}

#[test]
fn test_move_between_unknown_sessions() {
    let (pool, _) = pool_with(ProxyConfig::default());
    pool.acquire().unwrap().set_valid(true);
    assert!(matches!(
        pool.move_client(0, 9, 0),
        Err(ProxyError::UnknownSession(9))
    ));
    assert!(matches!(
        pool.move_client(5, 0, 0),
        Err(ProxyError::UnknownSession(5))
    ));
}

#[test]
fn test_move_into_shutting_down_session_refused() {
    let (pool, _) = pool_with(ProxyConfig::default());
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    a.set_valid(true);
    b.set_valid(true);
    b.set_shutdown(true);

    let slot = a.attach_client(ConnectionId::new(1), 1);
    assert!(matches!(pool.move_client(0, 1, slot), Err(ProxyError::Invalid)));
    assert!(a.client_at(slot).is_valid());
}

#[test]
fn test_sweep_terminates_silent_worker_after_retries() {
    let config = ProxyConfig {
        ping_timeout: Duration::from_millis(30),
        ping_attempts: 2,
        ..ProxyConfig::default()
    };
    let (pool, control) = pool_with(config);

    let mute = pool.acquire().unwrap();
    mute.set_srv(Pid::from_raw(4242));
    mute.set_valid(true);
    let (link, _worker_end) = UnixLink::pair("mute").unwrap();
    mute.set_link(Some(Arc::new(link) as Arc<dyn Link>));

    // never registered: skipped by the sweep
    pool.acquire().unwrap();

    let report = pool.sweep_liveness();
    assert_eq!(report.len(), 1);
    let (id, outcome) = &report[0];
    assert_eq!(*id, 0);
    match outcome {
        SweepOutcome::Terminated { cause, signal } => {
            assert!(matches!(cause, ProxyError::Timeout(_)));
            assert!(signal.is_ok());
        }
        other => panic!("expected termination, got {:?}", other),
    }
    assert_eq!(control.signal_count(), 1);
    assert!(!mute.is_valid());

    // the next sweep has nothing left to ping
    assert!(pool.sweep_liveness().is_empty());
}

#[test]
fn test_sweep_escalates_broken_link_immediately() {
    let config = ProxyConfig {
        ping_attempts: 5,
        ..ProxyConfig::default()
    };
    let (pool, control) = pool_with(config);
    let proxy = pool.acquire().unwrap();
    proxy.set_srv(Pid::from_raw(77));
    proxy.set_valid(true);
    let (link, worker_end) = UnixLink::pair("gone").unwrap();
    drop(worker_end);
    proxy.set_link(Some(Arc::new(link) as Arc<dyn Link>));

    let report = pool.sweep_liveness();
    assert!(matches!(
        report[0].1,
        SweepOutcome::Terminated {
            cause: ProxyError::Transport(_),
            ..
        }
    ));
    assert_eq!(control.signal_count(), 1);
}

#[test]
fn test_due_shutdowns_fire_once() {
    let (pool, control) = pool_with(ProxyConfig::default());
    let soon = pool.acquire().unwrap();
    soon.set_srv(Pid::from_raw(10));
    soon.set_valid(true);
    soon.request_shutdown(Duration::from_secs(1), true).unwrap();

    let disarmed = pool.acquire().unwrap();
    disarmed.set_srv(Pid::from_raw(11));
    disarmed.set_valid(true);
    disarmed.request_shutdown(Duration::ZERO, false).unwrap();

    let now = Instant::now();
    assert!(pool.due_shutdowns(now).is_empty());

    let later = now + Duration::from_secs(2);
    let fired = pool.run_due_shutdowns(later);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, 0);
    assert!(fired[0].1.is_ok());
    assert_eq!(control.signal_count(), 1);

    assert!(pool.run_due_shutdowns(later).is_empty());
    assert!(disarmed.is_valid());
}

#[test]
fn test_released_session_is_reusable() {
    let config = ProxyConfig {
        max_sessions: 1,
        ..ProxyConfig::default()
    };
    let (pool, _) = pool_with(config);
    let proxy = pool.acquire().unwrap();
    proxy.set_srv(Pid::from_raw(5));
    proxy.set_valid(true);
    proxy.terminate().unwrap();

    assert!(matches!(pool.acquire(), Err(ProxyError::PoolExhausted(1))));
    pool.release(0).unwrap();
    assert!(pool.get(0).is_none());

    let fresh = pool.acquire().unwrap();
    fresh.set_valid(true);
    assert!(fresh.is_valid());
    assert_eq!(fresh.srv_pid(), None);
}

#[test]
fn test_sweep_terminates_vanished_process_without_ping() {
    let (pool, control) = pool_with(ProxyConfig::default());
    let proxy = pool.acquire().unwrap();
    proxy.set_srv(Pid::from_raw(31337));
    proxy.set_valid(true);
    // no link attached: a ping would fail with NoLink
    control.exited.lock().push(Pid::from_raw(31337));

    let report = pool.sweep_liveness();
    assert!(matches!(
        report[0].1,
        SweepOutcome::Terminated {
            cause: ProxyError::NoSuchProcess,
            signal: Ok(()),
        }
    ));
    assert_eq!(control.signal_count(), 1);
    assert!(!proxy.is_valid());
}
