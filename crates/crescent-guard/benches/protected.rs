//! Overhead of protected wrappers against the raw primitives they guard.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use crescent_engine::EngineState;
use crescent_guard::protected;

fn seeded_state() -> EngineState {
    let mut state = EngineState::new();
    protected::new_table(&mut state).expect("table");
    for i in 1..=64i64 {
        state.push_int(i);
        state.push_int(i * 10);
        protected::raw_set(&mut state, -3).expect("seed entry");
    }
    state
}

fn bench_get_index(c: &mut Criterion) {
    let mut state = seeded_state();
    c.bench_function("protected_get_index", |b| {
        b.iter(|| {
            protected::get_index(&mut state, 1, black_box(7)).expect("get");
            state.pop(1);
        })
    });

    let mut state = seeded_state();
    c.bench_function("raw_get_field", |b| {
        b.iter(|| {
            state.push_int(black_box(7));
            state.raw_get_field(1);
            state.pop(1);
        })
    });
}

fn bench_push_bytes(c: &mut Criterion) {
    let payload = vec![0xabu8; 128];
    let mut state = seeded_state();
    c.bench_function("protected_push_bytes_128", |b| {
        b.iter(|| {
            protected::push_bytes(&mut state, black_box(&payload)).expect("push");
            state.pop(1);
        })
    });
}

criterion_group!(benches, bench_get_index, bench_push_bytes);
criterion_main!(benches);
