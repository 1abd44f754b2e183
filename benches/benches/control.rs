use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use harmoniq_fx_bridge::{LoopbackChannel, EQUALIZER};
use harmoniq_fx_client::{
    ControlArbiter, EffectConfig, EffectHandle, EffectRequest, ParamId, ParamValue,
    ParameterBatch, Priority,
};

fn arbiter_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbiter");

    group.bench_function("attach_detach_32", |b| {
        b.iter(|| {
            let mut arbiter = ControlArbiter::new();
            let ids: Vec<_> = (0..32)
                .map(|i| arbiter.attach(Priority(i % 7), false).attachment)
                .collect();
            for id in ids.into_iter().rev() {
                arbiter.detach(id);
            }
            arbiter.current_controller()
        });
    });

    group.finish();
}

fn batch_staging(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");

    group.bench_function("stage_and_encode_64", |b| {
        b.iter_batched(
            || ParameterBatch::with_capacity(4096),
            |mut batch| {
                for id in 0..64 {
                    batch
                        .stage(ParamId(id), ParamValue::from_i32(id as i32), 0)
                        .expect("stage");
                }
                batch.take().encode()
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn loopback_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("commit_3_params", |b| {
        let channel = LoopbackChannel::with_defaults().expect("bridge");
        let handle = EffectHandle::new(channel.clone(), EffectConfig::default());
        handle
            .init(&EffectRequest::for_type(EQUALIZER))
            .expect("attach");

        b.iter(|| {
            for id in 1..=3 {
                handle
                    .set_parameter_deferred(ParamId(id), ParamValue::from_i32(id as i32))
                    .expect("stage");
            }
            handle.commit_parameters().expect("commit");
        });
    });

    group.finish();
}

criterion_group!(benches, arbiter_churn, batch_staging, loopback_commit);
criterion_main!(benches);
