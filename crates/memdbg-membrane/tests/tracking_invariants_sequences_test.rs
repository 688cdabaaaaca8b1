use memdbg_membrane::{
    BlockPolicy, CallSite, GuardSide, MemDbgConfig, MemDbgError, QuarantineLimits, RecordPolicy,
    Tracker, TrackingContext, Usage, ValidateRequest, ValidationLevel,
};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Live,
}

fn site(line: u32) -> CallSite {
    CallSite::new("sequences.c", line)
}

fn configs() -> [MemDbgConfig; 3] {
    [
        MemDbgConfig::default(),
        MemDbgConfig::default()
            .with_block_policy(BlockPolicy::Quarantine(QuarantineLimits::UNBOUNDED)),
        MemDbgConfig::default()
            .with_block_policy(BlockPolicy::Quarantine(QuarantineLimits {
                max_bytes: 4096,
                max_entries: 8,
            }))
            .with_record_policy(RecordPolicy::Retain),
    ]
}

#[test]
fn deterministic_sequences_never_fail_deepest_validation() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 2_000;
    const SLOTS: usize = 32;

    for config in configs() {
        for seed in SEEDS {
            let ctx = TrackingContext::new(&config);
            let mut rng = XorShift64::new(seed);
            let mut ptrs = [std::ptr::null_mut::<u8>(); SLOTS];
            let mut sizes = [0_usize; SLOTS];
            let mut states = [SlotState::Empty; SLOTS];

            for step in 0..STEPS {
                let op = rng.gen_range_usize(0, 99);
                let idx = rng.gen_range_usize(0, SLOTS - 1);
                let line = step as u32;

                match op {
                    // allocate (biased)
                    0..=39 => {
                        if states[idx] != SlotState::Empty {
                            continue;
                        }
                        let size = rng.gen_range_usize(0, 512);
                        let ptr = ctx.allocate(size, site(line)).expect("alloc");
                        // Fill the whole payload, never past it.
                        unsafe { std::ptr::write_bytes(ptr.as_ptr(), seed as u8, size) };
                        ptrs[idx] = ptr.as_ptr();
                        sizes[idx] = size;
                        states[idx] = SlotState::Live;
                    }
                    // reallocate
                    40..=59 => {
                        if states[idx] != SlotState::Live {
                            continue;
                        }
                        let size = rng.gen_range_usize(1, 512);
                        let moved = unsafe { ctx.reallocate(ptrs[idx], size, site(line)) }
                            .expect("realloc")
                            .expect("non-zero size keeps a block");
                        let keep = sizes[idx].min(size);
                        let prefix = unsafe { std::slice::from_raw_parts(moved.as_ptr(), keep) };
                        assert!(
                            prefix.iter().all(|&b| b == seed as u8),
                            "seed={seed} step={step}: realloc must preserve {keep} bytes"
                        );
                        unsafe { std::ptr::write_bytes(moved.as_ptr(), seed as u8, size) };
                        ptrs[idx] = moved.as_ptr();
                        sizes[idx] = size;
                    }
                    // release
                    60..=89 => {
                        if states[idx] != SlotState::Live {
                            continue;
                        }
                        unsafe { ctx.release(ptrs[idx], site(line)) }.expect("release");
                        states[idx] = SlotState::Empty;
                    }
                    // validate at a random level
                    _ => {
                        let level = ValidationLevel::from_raw(rng.gen_range_usize(0, 3) as i32);
                        ctx.validate(&ValidateRequest::new(level))
                            .unwrap_or_else(|e| panic!("seed={seed} step={step}: {e}"));
                    }
                }
            }

            let live: usize = states.iter().filter(|&&s| s == SlotState::Live).count();
            let bytes: usize = (0..SLOTS)
                .filter(|&i| states[i] == SlotState::Live)
                .map(|i| sizes[i])
                .sum();
            assert_eq!(ctx.used(false), Usage { blocks: live, bytes });
            let report = ctx
                .validate(&ValidateRequest::new(ValidationLevel::Deepest).extended(true))
                .expect("clean run passes DEEPEST");
            assert_eq!(report.live_checked, live);

            for i in 0..SLOTS {
                if states[i] == SlotState::Live {
                    unsafe { ctx.release(ptrs[i], site(9_999)) }.expect("final release");
                }
            }
            assert_eq!(ctx.used(false), Usage::default());
        }
    }
}

#[test]
fn allocate_then_release_leaves_usage_unchanged() {
    let ctx = TrackingContext::default();
    let _held = ctx.allocate(100, site(1)).unwrap();
    let before = ctx.used(false);
    for size in [0, 1, 15, 16, 17, 4096] {
        let ptr = ctx.allocate(size, site(2)).unwrap();
        unsafe { ctx.release(ptr.as_ptr(), site(3)) }.unwrap();
        assert_eq!(ctx.used(false), before, "size={size}");
    }
}

#[test]
fn one_byte_overflow_is_reported_with_allocation_site() {
    let ctx = TrackingContext::default();
    let ptr = ctx.allocate(20, site(42)).unwrap();
    unsafe { ptr.as_ptr().add(20).write(0) };

    let err = ctx
        .validate(&ValidateRequest::new(ValidationLevel::Min))
        .unwrap_err();
    assert_eq!(err.allocated_at(), Some(site(42)));
    assert!(matches!(
        err,
        MemDbgError::GuardCorruption {
            side: GuardSide::Trailing,
            offset: 20,
            ..
        }
    ));
    assert!(err.to_string().contains("sequences.c:42"));
}

#[test]
fn underflow_is_reported_as_leading() {
    let ctx = TrackingContext::default();
    let ptr = ctx.allocate(20, site(7)).unwrap();
    unsafe { ptr.as_ptr().sub(1).write(0) };
    let err = unsafe { ctx.release(ptr.as_ptr(), site(8)) }.unwrap_err();
    assert!(matches!(
        err,
        MemDbgError::GuardCorruption {
            side: GuardSide::Leading,
            offset: -1,
            ..
        }
    ));
    assert_eq!(err.offending_site(), Some(site(8)));
}

#[test]
fn second_release_is_double_release_first_never() {
    let ctx = TrackingContext::default();
    for round in 0..16 {
        let ptr = ctx.allocate(round * 8, site(1)).unwrap();
        unsafe { ctx.release(ptr.as_ptr(), site(2)) }.expect("first release never fails");
        let err = unsafe { ctx.release(ptr.as_ptr(), site(3)) }.unwrap_err();
        assert_eq!(err.kind(), "DoubleRelease");
        // The allocator may recycle the address next round; that must stay clean.
    }
}

#[test]
fn null_release_never_errors() {
    let ctx = TrackingContext::default();
    for line in 0..100 {
        unsafe { ctx.release(std::ptr::null_mut(), site(line)) }.unwrap();
    }
    assert_eq!(ctx.used(true), Usage::default());
}

#[test]
fn realloc_sixteen_to_thirty_two_preserves_prefix() {
    let ctx = TrackingContext::default();
    let ptr = ctx.allocate(16, site(1)).unwrap();
    let pattern: Vec<u8> = (100..116).collect();
    unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), ptr.as_ptr(), 16) };

    let moved = unsafe { ctx.reallocate(ptr.as_ptr(), 32, site(2)) }
        .unwrap()
        .unwrap();
    let prefix = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 16) };
    assert_eq!(prefix, &pattern[..]);
    assert_eq!(ctx.find(moved.as_ptr()).unwrap().user_size, 32);
    assert_eq!(ctx.used(false), Usage { blocks: 1, bytes: 32 });
}

#[test]
fn leaked_blocks_appear_in_used_and_display() {
    const LEAKS: u32 = 5;
    let ctx = TrackingContext::default();
    let mut expected_bytes = 0;
    for i in 0..LEAKS {
        let size = 10 + i as usize;
        expected_bytes += size;
        ctx.allocate(size, site(200 + i)).unwrap();
        let transient = ctx.allocate(64, site(300 + i)).unwrap();
        unsafe { ctx.release(transient.as_ptr(), site(400 + i)) }.unwrap();
    }
    assert_eq!(
        ctx.used(false),
        Usage {
            blocks: LEAKS as usize,
            bytes: expected_bytes
        }
    );

    let mut out = Vec::new();
    ctx.display(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let rows: Vec<&str> = text.lines().filter(|l| l.contains("sequences.c")).collect();
    assert_eq!(rows.len(), LEAKS as usize, "{text}");
    for (i, row) in rows.iter().enumerate() {
        assert!(row.ends_with(&format!("sequences.c:{}", 200 + i)), "{row}");
    }
}

#[test]
fn write_after_release_is_caught_under_quarantine() {
    let config = MemDbgConfig::default()
        .with_block_policy(BlockPolicy::Quarantine(QuarantineLimits::DEFAULT));
    let ctx = TrackingContext::new(&config);
    let ptr = ctx.allocate(64, site(11)).unwrap();
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0x33, 64);
        ctx.release(ptr.as_ptr(), site(12)).unwrap();
        ptr.as_ptr().add(60).write(0x44);
    }
    let err = ctx
        .validate(&ValidateRequest::new(ValidationLevel::Deepest).with_message("exit"))
        .unwrap_err();
    assert!(matches!(
        err,
        MemDbgError::GuardCorruption {
            side: GuardSide::ReleasedPayload,
            offset: 60,
            ..
        }
    ));
    assert_eq!(err.allocated_at(), Some(site(11)));
}
