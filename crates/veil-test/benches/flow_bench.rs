use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use uuid::Uuid;
use veil_tunnel::proto::flow::FlowState;

fn bench_flow(c: &mut Criterion) {
	let user = Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap();
	let payload = vec![0x5au8; 16 * 1024];

	let mut group = c.benchmark_group("flow");
	group.throughput(Throughput::Bytes(payload.len() as u64));
	group.bench_function("pad_unpad_16k", |b| {
		b.iter(|| {
			let mut writer = FlowState::new(user, true);
			let mut reader = FlowState::new(user, true);
			let wire = writer.pad(&payload);
			let out = reader.unpad(&wire).unwrap();
			assert_eq!(out.len(), payload.len());
		});
	});
	group.finish();
}

criterion_group!(benches, bench_flow);
criterion_main!(benches);
