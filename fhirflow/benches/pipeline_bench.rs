//! Benchmarks for per-item step selection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fhirflow::core::{ClassifiedError, ItemSource, StageName, StageResult, WorkItem};
use fhirflow::pipeline::{BranchEvaluator, RetryPolicy, StageChain};
use serde_json::json;

fn item_at(stage: StageName, chain: &StageChain) -> WorkItem {
    let mut item = WorkItem::new(
        ItemSource {
            record_id: "bench".to_string(),
            receipt_handle: None,
            delivery_id: "bench-batch".to_string(),
        },
        "landing/bench.xml",
    );
    for s in chain.stages() {
        if item.transition(s.active_phase(), chain).is_err() || *s == stage {
            break;
        }
    }
    item
}

fn branch_benchmark(c: &mut Criterion) {
    let chain = StageChain::default();
    let evaluator = BranchEvaluator::default();

    let converting = item_at(StageName::Convert, &chain);
    let success = StageResult::success(json!({"Object": {"key": "landing/bench.xml"}}));
    c.bench_function("next_step_success", |b| {
        b.iter(|| evaluator.next_step(black_box(&converting), black_box(&success)));
    });

    let persisting = item_at(StageName::Persist, &chain);
    let throttled = StageResult::Failed(ClassifiedError::rate_limited("429"));
    c.bench_function("next_step_rate_limited", |b| {
        b.iter(|| evaluator.next_step(black_box(&persisting), black_box(&throttled)));
    });

    let policy = RetryPolicy::default();
    let error = ClassifiedError::rate_limited("429");
    c.bench_function("retry_decide", |b| {
        b.iter(|| policy.decide(black_box(StageName::Persist), black_box(3), black_box(&error)));
    });
}

criterion_group!(benches, branch_benchmark);
criterion_main!(benches);
