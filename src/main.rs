use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtcore::env::read_uint_from_env;
use rtcore::{Address, Runtime, RuntimeResult, Step, TaskCtx, TypeLayout, WaitReason};

/// `left`, `right`, `item`.
fn node_layout() -> TypeLayout {
    TypeLayout::new(3 * std::mem::size_of::<usize>(), &[0, 1])
}

fn bottom_up_tree(t: &mut TaskCtx, layout: &TypeLayout, depth: u32) -> RuntimeResult<Address> {
    t.enter_frame(2);
    if depth > 0 {
        let left = bottom_up_tree(t, layout, depth - 1)?;
        t.set_local(0, left)?;
        let right = bottom_up_tree(t, layout, depth - 1)?;
        t.set_local(1, right)?;
    }
    let node = t.alloc(layout);
    let left = t.local(0)?;
    let right = t.local(1)?;
    t.write_pointer(node, 0, left)?;
    t.write_pointer(node, 1, right)?;
    t.write_word(node, 2, depth as usize)?;
    t.leave_frame();
    Ok(node)
}

fn item_check(t: &TaskCtx, node: Address) -> RuntimeResult<usize> {
    let left = t.read_pointer(node, 0)?;
    if left.is_null() {
        return Ok(1);
    }
    let right = t.read_pointer(node, 1)?;
    Ok(1 + item_check(t, left)? + item_check(t, right)?)
}

fn main() {
    env_logger::init();

    let max_depth = read_uint_from_env("BINARYTREES_DEPTH").unwrap_or(16).max(6) as u32;
    let min_depth = 4;
    let rt = Runtime::from_env();

    let results = Arc::new(Mutex::new(Vec::new()));
    let pending = Arc::new(AtomicUsize::new(0));
    let mut spawned = false;

    rt.run(move |t: &mut TaskCtx| {
        let layout = node_layout();
        if !spawned {
            spawned = true;
            let stretch = bottom_up_tree(t, &layout, max_depth + 1).and_then(|n| item_check(t, n));
            match stretch {
                Ok(check) => println!("stretch tree of depth {}\t check: {}", max_depth + 1, check),
                Err(err) => {
                    log::error!("stretch tree failed: {}", err);
                    return Step::Exit;
                }
            }

            // The long-lived tree survives every collection through a global.
            let kept = bottom_up_tree(t, &layout, max_depth).and_then(|n| t.set_global(0, n));
            if let Err(err) = kept {
                log::error!("long lived tree failed: {}", err);
                return Step::Exit;
            }

            let main = t.id();
            for depth in (min_depth..=max_depth).step_by(2) {
                let iterations = 1usize << (max_depth - depth + min_depth);
                let results = results.clone();
                let pending = pending.clone();
                pending.fetch_add(1, Ordering::AcqRel);
                let mut done = 0;
                let mut check = 0;
                t.spawn(move |t: &mut TaskCtx| {
                    let layout = node_layout();
                    while done < iterations {
                        match bottom_up_tree(t, &layout, depth).and_then(|n| item_check(t, n)) {
                            Ok(c) => check += c,
                            Err(err) => log::error!("tree of depth {} failed: {}", depth, err),
                        }
                        done += 1;
                        if t.check_preempt() {
                            return Step::Yield;
                        }
                    }
                    results.lock().push((depth, iterations, check));
                    if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        t.ready(main);
                    }
                    Step::Exit
                });
            }
        }

        if pending.load(Ordering::Acquire) != 0 {
            t.set_wait_reason(WaitReason::External);
            return Step::Park;
        }

        let mut lines = results.lock().clone();
        lines.sort_unstable();
        for (depth, iterations, check) in lines {
            println!("{}\t trees of depth {}\t check: {}", iterations, depth, check);
        }
        match t.global(0).and_then(|n| item_check(t, n)) {
            Ok(check) => println!("long lived tree of depth {}\t check: {}", max_depth, check),
            Err(err) => log::error!("long lived tree failed: {}", err),
        }
        Step::Exit
    });

    println!("{}", rt.stats());
}
