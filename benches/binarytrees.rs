use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use rtcore::env::read_uint_from_env;

mod runtime {
    use rtcore::{Address, Runtime, RuntimeConfig, RuntimeResult, Step, TaskCtx, TypeLayout};

    fn layout() -> TypeLayout {
        TypeLayout::new(3 * std::mem::size_of::<usize>(), &[0, 1])
    }

    fn create_tree(t: &mut TaskCtx, layout: &TypeLayout, depth: usize) -> RuntimeResult<Address> {
        t.enter_frame(2);
        if depth > 0 {
            let left = create_tree(t, layout, depth - 1)?;
            t.set_local(0, left)?;
            let right = create_tree(t, layout, depth - 1)?;
            t.set_local(1, right)?;
        }
        let node = t.alloc(layout);
        let (left, right) = (t.local(0)?, t.local(1)?);
        t.write_pointer(node, 0, left)?;
        t.write_pointer(node, 1, right)?;
        t.write_word(node, 2, depth)?;
        t.leave_frame();
        Ok(node)
    }

    fn check_tree(t: &TaskCtx, node: Address) -> RuntimeResult<usize> {
        let left = t.read_pointer(node, 0)?;
        if left.is_null() {
            return Ok(1);
        }
        let right = t.read_pointer(node, 1)?;
        Ok(check_tree(t, left)? + check_tree(t, right)? + 1)
    }

    pub fn bench(max_depth: usize) {
        let rt = Runtime::new(RuntimeConfig::from_env());
        let mut depth = 4;
        rt.run(move |t: &mut TaskCtx| {
            let layout = layout();
            while depth <= max_depth {
                let iterations = 1 << (max_depth - depth + 4);
                for _ in 0..iterations {
                    let check = create_tree(t, &layout, depth).and_then(|n| check_tree(t, n));
                    if check.is_err() {
                        return Step::Exit;
                    }
                }
                depth += 2;
                if t.check_preempt() {
                    return Step::Yield;
                }
            }
            Step::Exit
        });
    }
}

mod rc {
    use std::rc::Rc;

    #[allow(dead_code)]
    pub struct TreeNode {
        item: usize,
        left: Option<Rc<TreeNode>>,
        right: Option<Rc<TreeNode>>,
    }

    fn create_tree(depth: usize) -> Rc<TreeNode> {
        let (left, right) = if depth > 0 {
            (Some(create_tree(depth - 1)), Some(create_tree(depth - 1)))
        } else {
            (None, None)
        };
        Rc::new(TreeNode {
            item: depth,
            left,
            right,
        })
    }

    fn check_tree(node: &TreeNode) -> usize {
        match (&node.left, &node.right) {
            (Some(left), Some(right)) => check_tree(left) + check_tree(right) + 1,
            _ => 1,
        }
    }

    pub fn bench(max_depth: usize) {
        let mut depth = 4;
        while depth <= max_depth {
            let iterations = 1 << (max_depth - depth + 4);
            for _ in 0..iterations {
                criterion::black_box(check_tree(&create_tree(depth)));
            }
            depth += 2;
        }
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    env_logger::init();
    let init_depth = match read_uint_from_env("TREE_DEPTH") {
        Some(x) if x > 6 => x,
        _ => 6,
    };
    let max_depth = match read_uint_from_env("MAX_TREE_DEPTH") {
        Some(x) if x > 6 => x,
        _ => init_depth + 2,
    };
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(10);

    for max_depth in init_depth..=max_depth {
        group.bench_with_input(
            BenchmarkId::new("Binary trees (rtcore)", max_depth),
            &max_depth,
            |b, input| b.iter(|| runtime::bench(*input)),
        );
        group.bench_with_input(
            BenchmarkId::new("Binary trees (std::rc::Rc)", max_depth),
            &max_depth,
            |b, input| b.iter(|| rc::bench(*input)),
        );
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
