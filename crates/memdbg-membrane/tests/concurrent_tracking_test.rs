use std::sync::Arc;
use std::thread;

use memdbg_membrane::{
    BlockPolicy, CallSite, MemDbgConfig, QuarantineLimits, Tracker, TrackingContext, Usage,
    ValidateRequest, ValidationLevel,
};

const THREADS: usize = 8;
const ROUNDS: usize = 500;

fn hammer(ctx: &Arc<TrackingContext>, keep_every: usize) -> Vec<(usize, usize)> {
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let ctx = Arc::clone(ctx);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for round in 0..ROUNDS {
                    let size = (t * 31 + round * 7) % 300;
                    let line = (t * ROUNDS + round) as u32;
                    let ptr = ctx
                        .allocate(size, CallSite::new("worker.rs", line))
                        .expect("alloc");
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), t as u8, size) };

                    let ptr = if round % 3 == 0 {
                        unsafe { ctx.reallocate(ptr.as_ptr(), size + 16, CallSite::new("worker.rs", line)) }
                            .expect("realloc")
                            .expect("block")
                    } else {
                        ptr
                    };
                    let size = if round % 3 == 0 { size + 16 } else { size };

                    if round % keep_every == 0 {
                        kept.push((ptr.as_ptr() as usize, size));
                    } else {
                        unsafe { ctx.release(ptr.as_ptr(), CallSite::new("worker.rs", line)) }
                            .expect("release");
                    }
                }
                kept
            })
        })
        .collect();

    handles
        .into_iter()
        .flat_map(|h| h.join().expect("worker panicked"))
        .collect()
}

#[test]
fn concurrent_primitives_keep_totals_consistent() {
    let ctx = Arc::new(TrackingContext::default());
    let kept = hammer(&ctx, 10);

    let expected = Usage {
        blocks: kept.len(),
        bytes: kept.iter().map(|&(_, size)| size).sum(),
    };
    assert_eq!(ctx.used(false), expected);
    ctx.validate(&ValidateRequest::new(ValidationLevel::Deeper))
        .expect("DEEPER passes after concurrent run");

    for (addr, _) in kept {
        unsafe { ctx.release(addr as *mut u8, CallSite::new("main.rs", 1)) }.unwrap();
    }
    assert_eq!(ctx.used(false), Usage::default());
    ctx.validate(&ValidateRequest::new(ValidationLevel::Deepest))
        .expect("DEEPEST passes after cleanup");
}

#[test]
fn concurrent_quarantine_stays_within_limits() {
    let limits = QuarantineLimits {
        max_bytes: 16 * 1024,
        max_entries: 32,
    };
    let config = MemDbgConfig::default().with_block_policy(BlockPolicy::Quarantine(limits));
    let ctx = Arc::new(TrackingContext::new(&config));
    let kept = hammer(&ctx, 7);

    let report = ctx
        .validate(&ValidateRequest::new(ValidationLevel::Deepest))
        .expect("DEEPEST passes with quarantine");
    assert_eq!(report.live_checked, kept.len());
    assert!(report.released_checked <= 16 * limits.max_entries);

    let metrics = ctx.metrics().unwrap();
    assert_eq!(metrics.allocations, (THREADS * ROUNDS) as u64);
    assert_eq!(metrics.guard_failures, 0);
}
