use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rtcore::gc::pacer::PacerConfig;
use rtcore::memory::cache::Cache;
use rtcore::memory::malloc::malloc;
use rtcore::memory::size_class::{class_objects, size_to_class};
use rtcore::memory::stats::HeapCounters;
use rtcore::memory::{sweep, Heap, ObjectState, SpanState, WORD_SIZE};
use rtcore::sched::ContextStatus;
use rtcore::{
    Address, Runtime, RuntimeConfig, Semaphore, Step, TaskCtx, TaskId, TraceBuffer, TraceEvent,
    TraceSink, TypeLayout, WaitReason,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(procs: usize) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_max_procs(procs)
        .with_max_heap(256 << 20)
}

/// Readies `main` once the last of the tasks counted by `left` is done.
fn task_done(t: &mut TaskCtx, left: &AtomicUsize, main: TaskId) {
    if left.fetch_sub(1, Ordering::AcqRel) == 1 {
        t.ready(main);
    }
}

/// Parks the main task until `left` drops to zero.
fn wait_for(t: &mut TaskCtx, left: &AtomicUsize) -> Option<Step> {
    if left.load(Ordering::Acquire) != 0 {
        t.set_wait_reason(WaitReason::External);
        return Some(Step::Park);
    }
    None
}

fn is_free(heap: &Heap, addr: Address) -> bool {
    match heap.lookup_object(addr) {
        Some(r) if r.base == addr => {
            let span = heap.span(r.span);
            span.state() != SpanState::InUse || span.objects().state(r.index) == ObjectState::Free
        }
        _ => true,
    }
}

#[test]
fn scenario_a_central_reclaims_and_recoalesces() {
    init_logging();
    let heap = Heap::new(16 << 20);
    let mut cache = Cache::new();
    let layout = TypeLayout::noscan(8);
    let class = size_to_class(8);
    assert!(class_objects(class) >= 10);

    let objs: Vec<Address> = (0..1000)
        .map(|_| malloc(&heap, &mut cache, &layout, ObjectState::White).addr)
        .collect();
    let spans: HashSet<_> = objs.iter().map(|&a| heap.lookup_object(a).unwrap().span).collect();
    let inuse = HeapCounters::load(&heap.counters.heap_inuse);
    assert!(inuse > 0);

    // Keep the first ten alive.
    for &a in &objs[..10] {
        let r = heap.lookup_object(a).unwrap();
        heap.span(r.span).objects().set_state(r.index, ObjectState::Black);
    }
    cache.release_all(&heap);
    heap.sweepgen.fetch_add(2, Ordering::AcqRel);
    heap.sweep.prepare(heap.in_use_spans());
    sweep::finish(&heap);

    assert_eq!(heap.counters.nfree.load(Ordering::Relaxed), 990);
    for &a in &objs[10..] {
        assert!(is_free(&heap, a));
    }
    for &a in &objs[..10] {
        assert!(!is_free(&heap, a));
    }
    // Only the span holding survivors is still in use; emptied ones went back
    // to the heap.
    let still_used = spans.iter().filter(|&&s| heap.span(s).state() == SpanState::InUse).count();
    assert_eq!(still_used, 1);
    assert!(HeapCounters::load(&heap.counters.heap_inuse) <= inuse);

    // Second generation: the survivors die too, and the free pages coalesce.
    heap.sweepgen.fetch_add(2, Ordering::AcqRel);
    heap.sweep.prepare(heap.in_use_spans());
    sweep::finish(&heap);
    assert_eq!(heap.counters.nfree.load(Ordering::Relaxed), 1000);
    assert!(spans.iter().all(|&s| heap.span(s).state() != SpanState::InUse));
    assert_eq!(HeapCounters::load(&heap.counters.heap_inuse), 0);
    assert_eq!(heap.free_span_count(), 1);
    heap.verify().unwrap();
}

#[derive(Default)]
struct SweepReport {
    garbage_freed: Vec<bool>,
    live_kept: Vec<bool>,
    freed: u64,
    cycles: u64,
}

#[test]
fn scenario_b_only_unreachable_objects_are_swept() {
    init_logging();
    let rt = Runtime::new(config(2));
    let report = Arc::new(Mutex::new(SweepReport::default()));
    let out = report.clone();
    let mut garbage = Vec::new();
    let mut live = Vec::new();
    let mut nfree_before = 0;
    let mut requested = false;

    rt.run(move |t: &mut TaskCtx| {
        if !requested {
            requested = true;
            let node = TypeLayout::pointers(2);
            let leaf = TypeLayout::noscan(16);

            // A chain of depth 5 rooted in a global; every node also points
            // to a pointer-free leaf.
            let root = t.alloc(&node);
            t.set_global(0, root).unwrap();
            live.push(root);
            let mut prev = root;
            for _ in 1..5 {
                let n = t.alloc(&node);
                t.write_pointer(prev, 0, n).unwrap();
                live.push(n);
                prev = n;
            }
            for i in 0..5 {
                let l = t.alloc(&leaf);
                t.write_pointer(live[i], 1, l).unwrap();
                live.push(l);
            }
            for _ in 0..3 {
                garbage.push(t.alloc(&node));
            }

            let heap = &t.runtime().heap;
            nfree_before = heap.counters.nfree.load(Ordering::Acquire);
            if t.request_gc() {
                return Step::Park;
            }
        }

        let rt = t.runtime().clone();
        sweep::finish(&rt.heap);
        let mut report = out.lock();
        report.garbage_freed = garbage.iter().map(|&a| is_free(&rt.heap, a)).collect();
        report.live_kept = live.iter().map(|&a| !is_free(&rt.heap, a)).collect();
        report.freed = rt.heap.counters.nfree.load(Ordering::Acquire) - nfree_before;
        report.cycles = rt.gc.num_gc();
        Step::Exit
    });

    let report = report.lock();
    assert!(report.cycles >= 1);
    assert_eq!(report.garbage_freed, vec![true; 3]);
    assert_eq!(report.live_kept, vec![true; 10]);
    assert_eq!(report.freed, 3);
}

#[test]
fn scenario_c_tasks_spread_over_contexts() {
    init_logging();
    let procs = 4;
    let tasks = 8 * procs;
    let rt = Runtime::new(config(procs).with_gc_percent(None));
    let state = rt.state().clone();
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let left = Arc::new(AtomicUsize::new(tasks));
    let ran = Arc::new(AtomicUsize::new(0));

    // Looks at every context once per round until the tasks are done and
    // records rounds where queued work sat next to a context that stayed
    // idle since the previous round.
    let l = left.clone();
    let sampler = std::thread::spawn(move || {
        let mut rounds = 0;
        let mut stuck = Vec::new();
        let mut before: Option<(Vec<bool>, Vec<usize>)> = None;
        while l.load(Ordering::Acquire) != 0 {
            let contexts = &state.sched.contexts;
            let idle: Vec<bool> = contexts
                .iter()
                .map(|c| c.status() == ContextStatus::Idle)
                .collect();
            let queued: Vec<usize> = contexts.iter().map(|c| c.runq_len()).collect();
            if let Some((idle_before, queued_before)) = &before {
                let idle_twice = (0..procs).any(|c| idle[c] && idle_before[c]);
                let held = (0..procs).any(|c| queued[c] > 0 && queued_before[c] > 0);
                if idle_twice && held {
                    stuck.push((rounds, idle.clone(), queued.clone()));
                }
            }
            before = Some((idle, queued));
            rounds += 1;
            std::thread::sleep(Duration::from_millis(2));
        }
        (rounds, stuck)
    });

    let (seen2, left2, ran2) = (seen.clone(), left.clone(), ran.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            for _ in 0..tasks {
                let (seen, left, ran) = (seen2.clone(), left2.clone(), ran2.clone());
                t.spawn(move |t: &mut TaskCtx| {
                    seen.lock().insert(t.context().id);
                    let start = Instant::now();
                    while start.elapsed() < Duration::from_millis(3) {
                        std::hint::spin_loop();
                    }
                    ran.fetch_add(1, Ordering::Relaxed);
                    task_done(t, &left, main);
                    Step::Exit
                });
            }
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    let (rounds, stuck) = sampler.join().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), tasks);
    assert!(seen.lock().len() >= 2, "all tasks ran on one context");
    assert!(rounds >= 2);
    assert!(
        stuck.is_empty(),
        "work stayed queued next to an idle context: {:?}",
        stuck
    );
    assert!(rt.state().sched.contexts.iter().all(|c| c.runq_is_empty()));
}

#[test]
fn scenario_d_stop_the_world_freezes_tasks() {
    init_logging();
    let rt = Runtime::new(config(3).with_gc_percent(None));
    let state = rt.state().clone();
    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let left = Arc::new(AtomicUsize::new(3));

    let (c, s) = (counter.clone(), stop.clone());
    let observer = std::thread::spawn(move || {
        while c.load(Ordering::Acquire) < 1000 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(state.stop_the_world("test"));
        let all_stopped = state
            .sched
            .contexts
            .iter()
            .all(|ctx| ctx.status() == ContextStatus::GcStop);
        let frozen = c.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(20));
        let later = c.load(Ordering::Acquire);
        state.start_the_world();

        let resumed_from = c.load(Ordering::Acquire);
        while c.load(Ordering::Acquire) == resumed_from {
            std::thread::sleep(Duration::from_millis(1));
        }
        s.store(true, Ordering::Release);
        (all_stopped, frozen, later)
    });

    let (counter2, stop2, left2) = (counter.clone(), stop.clone(), left.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            for _ in 0..3 {
                let (counter, stop, left) = (counter2.clone(), stop2.clone(), left2.clone());
                t.spawn(move |t: &mut TaskCtx| loop {
                    if stop.load(Ordering::Acquire) {
                        task_done(t, &left, main);
                        return Step::Exit;
                    }
                    counter.fetch_add(1, Ordering::AcqRel);
                    if t.check_preempt() {
                        return Step::Yield;
                    }
                });
            }
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    let (all_stopped, frozen, later) = observer.join().unwrap();
    assert!(all_stopped);
    assert_eq!(frozen, later, "a task ran while the world was stopped");
}

#[test]
fn long_running_task_does_not_starve_others_on_one_context() {
    init_logging();
    let rt = Runtime::new(config(1).with_gc_percent(None));
    let flag = Arc::new(AtomicBool::new(false));
    let left = Arc::new(AtomicUsize::new(2));

    let (flag2, left2) = (flag.clone(), left.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            let (f, l) = (flag2.clone(), left2.clone());
            // Spins until the other task has run.
            t.spawn(move |t: &mut TaskCtx| loop {
                if f.load(Ordering::Acquire) {
                    task_done(t, &l, main);
                    return Step::Exit;
                }
                if t.check_preempt() {
                    return Step::Yield;
                }
            });
            let (f, l) = (flag2.clone(), left2.clone());
            t.spawn(move |t: &mut TaskCtx| {
                f.store(true, Ordering::Release);
                task_done(t, &l, main);
                Step::Exit
            });
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    assert!(flag.load(Ordering::Acquire));
}

#[test]
fn yielding_tasks_take_turns_on_one_context() {
    init_logging();
    const TASKS: usize = 8;
    const RUNS: usize = 20;
    let rt = Runtime::new(config(1).with_gc_percent(None));
    let order = Arc::new(Mutex::new(Vec::new()));
    let left = Arc::new(AtomicUsize::new(TASKS));

    let (order2, left2) = (order.clone(), left.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            for i in 0..TASKS {
                let (order, left) = (order2.clone(), left2.clone());
                let mut runs = 0;
                t.spawn(move |t: &mut TaskCtx| {
                    order.lock().push(i);
                    runs += 1;
                    if runs < RUNS {
                        return Step::Yield;
                    }
                    task_done(t, &left, main);
                    Step::Exit
                });
            }
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    let order = order.lock();
    assert_eq!(order.len(), TASKS * RUNS);
    let first: HashSet<usize> = order[..TASKS].iter().copied().collect();
    assert_eq!(first.len(), TASKS, "a task ran twice in the first round");

    // Between two runs of a task every other task runs once. The global
    // queue check on every 61st tick can pull one task a round ahead, which
    // shows up as a second run inside the windows of the others.
    let mut doubled = 0;
    for i in 0..TASKS {
        let at: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|&(_, &j)| j == i)
            .map(|(n, _)| n)
            .collect();
        for w in at.windows(2) {
            let mut counts = [0usize; TASKS];
            for &j in &order[w[0] + 1..w[1]] {
                counts[j] += 1;
            }
            let most = counts.iter().copied().max().unwrap_or(0);
            assert!(most <= 2, "task {} waited through {} runs of another", i, most);
            if most == 2 {
                doubled += 1;
            }
        }
    }
    // Every run is a tick, plus the two steps of the main task.
    let ticks = order.len() + 2;
    assert!(
        doubled <= (ticks / 61 + 1) * TASKS,
        "{} windows saw a task out of turn",
        doubled
    );
}

#[test]
#[should_panic(expected = "all tasks are asleep")]
fn deadlock_is_fatal() {
    init_logging();
    let rt = Runtime::new(config(2));
    let sem = Semaphore::new(0);
    rt.run(move |t: &mut TaskCtx| {
        if sem.acquire(t) {
            Step::Exit
        } else {
            Step::Park
        }
    });
}

#[test]
fn semaphore_hands_units_to_waiters() {
    init_logging();
    let rt = Runtime::new(config(2));
    let sem = Arc::new(Semaphore::new(0));
    let left = Arc::new(AtomicUsize::new(2));
    let got = Arc::new(AtomicUsize::new(0));

    let (sem2, left2, got2) = (sem.clone(), left.clone(), got.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            let (s, l, g) = (sem2.clone(), left2.clone(), got2.clone());
            t.spawn(move |t: &mut TaskCtx| {
                while g.load(Ordering::Relaxed) < 3 {
                    if !s.acquire(t) {
                        return Step::Park;
                    }
                    g.fetch_add(1, Ordering::Relaxed);
                }
                task_done(t, &l, main);
                Step::Exit
            });
            let (s, l) = (sem2.clone(), left2.clone());
            let mut released = 0;
            t.spawn(move |t: &mut TaskCtx| {
                s.release(t);
                released += 1;
                if released < 3 {
                    return Step::Yield;
                }
                task_done(t, &l, main);
                Step::Exit
            });
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    assert_eq!(got.load(Ordering::Relaxed), 3);
    assert_eq!(sem.count(), 0);
    assert_eq!(sem.waiters(), 0);
}

#[test]
fn io_token_wakes_the_task() {
    init_logging();
    let rt = Runtime::new(config(2));
    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    let mut waiting = false;
    rt.run(move |t: &mut TaskCtx| {
        if !waiting {
            waiting = true;
            let token = t.wait_io();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                token.post();
            });
            return Step::Park;
        }
        w.store(true, Ordering::Release);
        Step::Exit
    });
    assert!(woke.load(Ordering::Acquire));
}

#[test]
fn blocking_call_releases_the_context() {
    init_logging();
    let rt = Runtime::new(config(1).with_gc_percent(None));
    let in_call = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let left = Arc::new(AtomicUsize::new(2));

    let (in_call2, overlapped2, left2) = (in_call.clone(), overlapped.clone(), left.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            let (ic, ov, l) = (in_call2.clone(), overlapped2.clone(), left2.clone());
            let mut called = false;
            t.spawn(move |t: &mut TaskCtx| {
                if called {
                    task_done(t, &l, main);
                    return Step::Exit;
                }
                called = true;
                // Runs while this task sits in the call below.
                let (ic2, ov2, l2) = (ic.clone(), ov.clone(), l.clone());
                t.spawn(move |t: &mut TaskCtx| {
                    ov2.store(ic2.load(Ordering::Acquire), Ordering::Release);
                    task_done(t, &l2, main);
                    Step::Exit
                });
                let ic = ic.clone();
                Step::Syscall(Box::new(move || {
                    ic.store(true, Ordering::Release);
                    std::thread::sleep(Duration::from_millis(100));
                    ic.store(false, Ordering::Release);
                }))
            });
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    assert!(overlapped.load(Ordering::Acquire));
}

#[test]
fn locked_task_stays_on_its_thread() {
    init_logging();
    let rt = Runtime::new(config(2).with_gc_percent(None));
    let threads = Arc::new(Mutex::new(Vec::new()));
    let left = Arc::new(AtomicUsize::new(3));

    let (threads2, left2) = (threads.clone(), left.clone());
    let mut spawned = false;
    rt.run(move |t: &mut TaskCtx| {
        if !spawned {
            spawned = true;
            let main = t.id();
            let (th, l) = (threads2.clone(), left2.clone());
            let mut steps = 0;
            t.spawn(move |t: &mut TaskCtx| {
                if steps == 0 {
                    t.lock_thread();
                }
                th.lock().push(t.thread_id());
                steps += 1;
                if steps < 5 {
                    return Step::Yield;
                }
                t.unlock_thread();
                task_done(t, &l, main);
                Step::Exit
            });
            // Competition for the contexts.
            for _ in 0..2 {
                let l = left2.clone();
                let mut n = 0;
                t.spawn(move |t: &mut TaskCtx| {
                    n += 1;
                    if n < 20 {
                        return Step::Yield;
                    }
                    task_done(t, &l, main);
                    Step::Exit
                });
            }
        }
        wait_for(t, &left2).unwrap_or(Step::Exit)
    });

    let threads = threads.lock();
    assert_eq!(threads.len(), 5);
    assert!(threads.iter().all(|&m| m == threads[0]));
}

#[test]
fn collect_from_outside_runs_a_full_cycle() {
    init_logging();
    let rt = Runtime::new(config(2));
    let collected = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let done = collected.clone();
        let rt = &rt;
        scope.spawn(move || {
            // Wait for the main task to be running.
            while !rt.state().sched.main_started() {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(rt.collect());
            done.store(true, Ordering::Release);
        });

        let done = collected.clone();
        let start = Instant::now();
        rt.run(move |t: &mut TaskCtx| {
            let _ = t.alloc(&TypeLayout::pointers(4));
            if done.load(Ordering::Acquire) || start.elapsed() > Duration::from_secs(10) {
                return Step::Exit;
            }
            std::thread::sleep(Duration::from_millis(1));
            Step::Yield
        });
    });

    assert!(collected.load(Ordering::Acquire));
    assert!(rt.num_gc() >= 1);
    let stats = rt.stats();
    assert_eq!(stats.num_gc as u64, rt.num_gc());
    assert!(stats.next_gc > 0);
}

#[test]
fn collections_keep_reachable_data() {
    init_logging();
    let pacer = PacerConfig {
        heap_minimum: 256 << 10,
        ..PacerConfig::default()
    };
    let rt = Runtime::new(config(4).with_pacer(pacer));
    const NODES: usize = 500;
    const STEPS: usize = 200;
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let out = errors.clone();
    let mut step = 0;

    rt.run(move |t: &mut TaskCtx| {
        // `next`, `extra`, `index`.
        let node = TypeLayout::new(3 * WORD_SIZE, &[0, 1]);
        let payload = TypeLayout::noscan(32);
        let check = |r: rtcore::RuntimeResult<()>| {
            if let Err(err) = r {
                out.lock().push(err.to_string());
            }
        };

        if step == 0 {
            for i in 0..NODES {
                let n = t.alloc(&node);
                check(t.global(0).and_then(|head| t.write_pointer(n, 0, head)));
                check(t.write_word(n, 2, i));
                check(t.set_global(0, n));
            }
        } else if step <= STEPS {
            // Garbage, plus one pointer store into an old node per step.
            for i in 0..1000 {
                let size = 16 + (i % 8) * 32;
                let _ = t.alloc(&TypeLayout::noscan(size));
            }
            let p = t.alloc(&payload);
            check(t.write_word(p, 0, step));
            let mut cur = t.global(0).unwrap_or(Address::NULL);
            for _ in 0..step % NODES {
                cur = t.read_pointer(cur, 0).unwrap_or(Address::NULL);
            }
            check(t.write_pointer(cur, 1, p));
        } else {
            let mut cur = t.global(0).unwrap_or(Address::NULL);
            let mut count = 0;
            while !cur.is_null() {
                match t.read_word(cur, 2) {
                    Ok(index) if index == NODES - 1 - count => {}
                    Ok(index) => out.lock().push(format!("node {} has index {}", count, index)),
                    Err(err) => out.lock().push(err.to_string()),
                }
                match t.read_pointer(cur, 1) {
                    Ok(extra) if !extra.is_null() => {
                        if let Err(err) = t.read_word(extra, 0) {
                            out.lock().push(format!("payload of node {}: {}", count, err));
                        }
                    }
                    Ok(_) => {}
                    Err(err) => out.lock().push(err.to_string()),
                }
                count += 1;
                cur = t.read_pointer(cur, 0).unwrap_or(Address::NULL);
            }
            if count != NODES {
                out.lock().push(format!("list has {} nodes", count));
            }
            return Step::Exit;
        }
        step += 1;
        Step::Yield
    });

    assert!(errors.lock().is_empty(), "{:?}", errors.lock());
    assert!(rt.num_gc() >= 1);
}

#[test]
fn trace_sink_sees_tasks_and_cycles() {
    init_logging();
    let rt = Runtime::new(config(2));
    let sink = Arc::new(TraceBuffer::new());
    rt.set_trace_sink(Some(sink.clone() as Arc<dyn TraceSink>));
    let mut requested = false;
    rt.run(move |t: &mut TaskCtx| {
        if !requested {
            requested = true;
            t.spawn(|_: &mut TaskCtx| Step::Exit);
            if t.request_gc() {
                return Step::Park;
            }
        }
        Step::Exit
    });
    rt.set_trace_sink(None);

    let events: Vec<TraceEvent> = sink.take().into_iter().map(|(_, e)| e).collect();
    assert!(events.iter().any(|e| matches!(e, TraceEvent::TaskCreate { parent: Some(_), .. })));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::TaskStart { .. })));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::TaskEnd { .. })));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::GcStart { .. })));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::GcDone { .. })));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::StwStart)));
    assert!(events.iter().any(|e| matches!(e, TraceEvent::TaskBlock { reason: WaitReason::GcCompletion, .. })));
}

#[test]
fn mutator_faults_are_recoverable() {
    init_logging();
    let rt = Runtime::new(config(1));
    let results = Arc::new(Mutex::new(Vec::new()));
    let out = results.clone();
    rt.run(move |t: &mut TaskCtx| {
        let obj = t.alloc(&TypeLayout::new(2 * WORD_SIZE, &[0]));
        let mut r = out.lock();
        r.push(t.read_pointer(Address::NULL, 0).map(|_| ()));
        r.push(t.read_pointer(obj, 2).map(|_| ()));
        r.push(t.read_word(obj, 0).map(|_| ()));
        r.push(t.write_pointer(obj, 1, obj));
        r.push(t.write_pointer(obj, 0, Address::from_usize(obj.to_usize() + WORD_SIZE)));
        r.push(t.write_pointer(obj, 0, obj));
        Step::Exit
    });

    use rtcore::RuntimeError::*;
    let r = results.lock();
    assert_eq!(r[0], Err(NilDereference));
    assert_eq!(r[1], Err(OutOfBounds { slot: 2, len: 2 }));
    assert_eq!(r[2], Err(PointerSlot(0)));
    assert_eq!(r[3], Err(NotPointer(1)));
    assert!(matches!(r[4], Err(InvalidAddress(_))));
    assert_eq!(r[5], Ok(()));
}

#[test]
fn free_os_memory_releases_idle_pages() {
    init_logging();
    let rt = Runtime::new(config(1));
    rt.run(|t: &mut TaskCtx| {
        for _ in 0..100 {
            let _ = t.alloc(&TypeLayout::noscan(64));
        }
        Step::Exit
    });

    let released = rt.free_os_memory();
    assert!(released > 0);
    assert!(rt.stats().heap_released >= released);
    rt.state().heap.verify().unwrap();
}
