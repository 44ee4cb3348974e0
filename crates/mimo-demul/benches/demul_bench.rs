//! Benchmarks for the uplink demodulation path
//!
//! Run with: cargo bench -p mimo-demul --bench demul_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mimo_demul::demod::{Modulation, SoftDemodulator};
use mimo_demul::equalize::{BatchedKernel, DirectKernel, MatVecKernel};
use mimo_demul::gather::{GatherGeometry, Gatherer, LaneGather, ScalarGather};
use mimo_demul::matrix::CMatView;
use mimo_demul::prelude::*;
use mimo_demul::synth::UplinkScenario;
use mimo_demul::types::{Llr, SCS_PER_CACHELINE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn random_samples(n: usize, seed: u64) -> Vec<IQSample> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| IQSample::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .collect()
}

// ============================================================================
// Equalization Kernels
// ============================================================================

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("equalize_gemv");

    for (ue, ant) in [(4usize, 8usize), (8, 32), (16, 64)] {
        let w = random_samples(ue * ant, 1);
        let x = random_samples(ant, 2);
        let mut y = vec![IQSample::new(0.0, 0.0); ue];
        let a = CMatView::row_major(&w, ue, ant).unwrap();
        let batched = BatchedKernel::plan(ue, ant).unwrap();
        let label = format!("{}x{}", ue, ant);

        group.throughput(Throughput::Elements((ue * ant) as u64));

        group.bench_with_input(BenchmarkId::new("direct", &label), &label, |b, _| {
            b.iter(|| DirectKernel.gemv(&a, black_box(&x), &mut y))
        });

        group.bench_with_input(BenchmarkId::new("batched", &label), &label, |b, _| {
            b.iter(|| batched.gemv(&a, black_box(&x), &mut y))
        });
    }

    group.finish();
}

// ============================================================================
// Gather
// ============================================================================

fn bench_gather(c: &mut Criterion) {
    let mut group = c.benchmark_group("gather");
    let ofdm_data_num = 1200;

    for ant in [8usize, 32, 64] {
        let geom = GatherGeometry::new(ant, ofdm_data_num, SampleLayout::PartialTranspose, 64);
        let src = random_samples(geom.buffer_len(), 3);
        let mut dst = vec![IQSample::new(0.0, 0.0); SCS_PER_CACHELINE * ant];

        group.throughput(Throughput::Elements((SCS_PER_CACHELINE * ant) as u64));

        let strategies: [(&str, Box<dyn Gatherer>); 3] = [
            ("scalar", Box::new(ScalarGather)),
            ("lane4", Box::new(LaneGather::<4>)),
            ("lane8", Box::new(LaneGather::<8>)),
        ];
        for (name, gatherer) in strategies.iter() {
            group.bench_with_input(BenchmarkId::new(*name, ant), &ant, |b, _| {
                b.iter(|| gatherer.gather(&geom, black_box(&src), 64, &mut dst))
            });
        }
    }

    group.finish();
}

// ============================================================================
// Soft Demodulation
// ============================================================================

fn bench_demod(c: &mut Criterion) {
    let mut group = c.benchmark_group("soft_demod");
    let symbols = random_samples(1200, 4);

    for modulation in [Modulation::Qpsk, Modulation::Qam16, Modulation::Qam64] {
        let demod = SoftDemodulator::new(modulation, 32.0);
        let mut out: Vec<Llr> = vec![0; symbols.len() * modulation.bits_per_symbol()];

        group.throughput(Throughput::Elements(symbols.len() as u64));
        group.bench_function(modulation.to_string(), |b| {
            b.iter(|| demod.demodulate(black_box(&symbols), &mut out))
        });
    }

    group.finish();
}

// ============================================================================
// Full Task
// ============================================================================

fn bench_launch(c: &mut Criterion) {
    let mut group = c.benchmark_group("demul_task");

    for (ant, ue) in [(8usize, 4usize), (64, 16)] {
        let cfg = Arc::new(DemulConfig {
            bs_ant_num: ant,
            ue_num: ue,
            ofdm_data_num: 1200,
            demul_block_size: 48,
            transpose_block_size: 64,
            ul_pilot_symbols: 1,
            ul_data_symbols: 2,
            mod_order_bits: 4,
            frame_window: 2,
            ..Default::default()
        });
        let scenario = UplinkScenario::random(&cfg, 9).unwrap();
        let window = Arc::new(FrameWindow::new(&cfg).unwrap());
        scenario.load(&window, 0).unwrap();

        let sink = StatsSink::new(1);
        let mut demul =
            DoDemul::new(Arc::clone(&cfg), 0, Arc::clone(&window), scenario.pilots(), &sink).unwrap();

        group.throughput(Throughput::Elements(cfg.demul_block_size as u64));
        group.bench_with_input(
            BenchmarkId::new("data_symbol", format!("{}x{}", ant, ue)),
            &ant,
            |b, _| b.iter(|| demul.launch(black_box(TaskTag::frm_sym_sc(0, 1, 48))).unwrap()),
        );
    }

    group.finish();
}

criterion_group!(
    name = kernel_benches;
    config = Criterion::default();
    targets = bench_kernels, bench_gather
);

criterion_group!(
    name = pipeline_benches;
    config = Criterion::default();
    targets = bench_demod, bench_launch
);

criterion_main!(kernel_benches, pipeline_benches);
