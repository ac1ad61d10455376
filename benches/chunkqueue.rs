// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kvik::chunk::ChunkQueue;
use kvik::filter_chunked::{chunked_decode, chunked_encode, ChunkedDecodeState};

const SIZES: [usize; 3] = [1024, 16 * 1024, 256 * 1024];

fn steal_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunkqueue_steal");
    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let payload = Bytes::from(vec![0x5au8; size]);
        group.bench_with_input(BenchmarkId::new("steal_all", size), &payload, |b, p| {
            b.iter(|| {
                let mut src = ChunkQueue::new();
                for chunk in p.chunks(4096) {
                    src.append_bytes(p.slice_ref(chunk)).unwrap();
                }
                let mut dst = ChunkQueue::new();
                dst.steal_all(black_box(&mut src)).unwrap();
                dst.length()
            })
        });
    }
    group.finish();
}

fn chunked_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_coding");
    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let payload = Bytes::from(vec![0x5au8; size]);
        group.bench_with_input(
            BenchmarkId::new("encode_decode", size),
            &payload,
            |b, p| {
                b.iter(|| {
                    let mut body = ChunkQueue::new();
                    body.append_bytes(p.clone()).unwrap();
                    body.close();
                    let mut wire = ChunkQueue::new();
                    chunked_encode(&mut wire, &mut body);
                    let mut decoded = ChunkQueue::new();
                    let mut state = ChunkedDecodeState::new();
                    chunked_decode(&mut decoded, &mut wire, &mut state);
                    decoded.length()
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, steal_benchmark, chunked_benchmark);
criterion_main!(benches);
